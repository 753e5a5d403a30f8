use crate::db::cms::quality_archive::CmsQualityArchive;
use crate::db::hhs::capacity_archive::HhsCapacityArchive;

pub struct ProdDb {}

impl ProdDb {
    /// Weekly HHS capacity files are dropped in the hhs_data directory by
    /// the download job.
    pub fn hhs_capacity() -> HhsCapacityArchive {
        HhsCapacityArchive {
            base_dir: "hhs_data".to_string(),
        }
    }

    /// CMS quality files are dropped in the hospital_qualities directory.
    pub fn cms_quality() -> CmsQualityArchive {
        CmsQualityArchive {
            base_dir: "hospital_qualities".to_string(),
        }
    }
}
