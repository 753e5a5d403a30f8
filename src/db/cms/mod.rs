pub mod quality_archive;
