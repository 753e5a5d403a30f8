use std::{error::Error, path::Path};

use clap::Parser;
use hospdb::db::{lib_load, prod_db::ProdDb};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Name of the weekly capacity file inside the hhs_data directory,
    /// e.g. 2022-09-23-hhs-data.csv
    file: String,

    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,
}

/// Run this job once for every weekly HHS capacity file.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    dotenvy::from_path(Path::new(format!(".env/{}.env", args.env).as_str()))?;

    let archive = ProdDb::hhs_capacity();
    let mut client = lib_load::connect()?;
    archive.load(&mut client, &args.file)?;
    client.close()?;

    Ok(())
}
