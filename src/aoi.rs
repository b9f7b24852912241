//! Named area presets.
//!
//! A fixed table of bounding boxes for areas with known land-use change,
//! usable from the CLI with `ndvi analyze --area <name>`.

use crate::models::BBox;

/// A named bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaPreset {
    pub name: &'static str,
    pub description: &'static str,
    pub bbox: [f64; 4],
}

impl AreaPreset {
    const fn new(name: &'static str, description: &'static str, bbox: [f64; 4]) -> Self {
        Self {
            name,
            description,
            bbox,
        }
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3])
    }
}

pub const DEFAULT_AREA: &str = "gurgaon_south_delhi";

pub const PRESETS: &[AreaPreset] = &[
    AreaPreset::new("gurgaon_south_delhi", "Rapid urban expansion", [77.0, 28.4, 77.3, 28.7]),
    AreaPreset::new("noida_greater_noida", "Planned development", [77.3, 28.4, 77.7, 28.7]),
    AreaPreset::new("bangalore_electronic_city", "IT expansion", [77.6, 12.8, 77.9, 13.1]),
    AreaPreset::new("pune_hinjewadi", "Tech hub", [73.6, 18.5, 73.8, 18.7]),
    AreaPreset::new("mumbai_navi_mumbai", "Long-term development", [72.8, 19.0, 73.2, 19.3]),
    AreaPreset::new("hyderabad_cyberabad", "Modern planning", [78.3, 17.4, 78.6, 17.6]),
    AreaPreset::new("chennai_omr", "Coastal development", [80.2, 12.8, 80.4, 13.0]),
    AreaPreset::new("delhi_dwarka", "Planned sub-city", [77.0, 28.5, 77.2, 28.7]),
    AreaPreset::new("ahmedabad_sanand", "Industrial development", [72.3, 22.9, 72.7, 23.2]),
    AreaPreset::new("kolkata_salt_lake", "Wetland conversion", [88.4, 22.5, 88.5, 22.6]),
    AreaPreset::new("chennai_it_corridor", "IT corridor", [80.1, 12.7, 80.3, 12.9]),
    AreaPreset::new("kochi_infopark", "IT development", [76.3, 9.9, 76.4, 10.1]),
    AreaPreset::new("jaipur_mahindra_world_city", "Planned city", [76.6, 26.8, 76.8, 27.0]),
    AreaPreset::new("coimbatore_tidel_park", "IT park", [76.9, 10.9, 77.1, 11.1]),
    AreaPreset::new("delhi_sample", "Small sample area", [76.85, 28.60, 76.95, 28.70]),
    AreaPreset::new("mumbai_central", "Dense urban", [72.8, 19.0, 72.9, 19.1]),
    AreaPreset::new("bangalore_central", "Urban core", [77.5, 12.9, 77.6, 13.0]),
];

/// Look up a preset by exact name.
pub fn find(name: &str) -> Option<&'static AreaPreset> {
    PRESETS.iter().find(|p| p.name == name)
}
