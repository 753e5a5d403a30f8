pub mod cms;
pub mod hhs;
pub mod lib_load;
pub mod prod_db;
