use std::{error::Error, path::Path};

use clap::Parser;
use hospdb::db::{lib_load, prod_db::ProdDb};
use jiff::civil::Date;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Date of the quality report, e.g. 2021-07-01.  The file itself does
    /// not carry one.
    report_date: String,

    /// Name of the quality file inside the hospital_qualities directory,
    /// e.g. Hospital_General_Information-2021-07.csv
    file: String,

    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,
}

/// Run this job once for every CMS quality file.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    dotenvy::from_path(Path::new(format!(".env/{}.env", args.env).as_str()))?;

    let report_date: Date = args.report_date.parse()?;

    let archive = ProdDb::cms_quality();
    let mut client = lib_load::connect()?;
    archive.load(&mut client, report_date, &args.file)?;
    client.close()?;

    Ok(())
}
