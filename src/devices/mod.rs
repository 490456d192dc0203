//! Device registry.
//!
//! Maps user-uploaded manual filenames and indexed collection names onto
//! clean device identities (display name, type, collection key). The first
//! device returned is the primary device injected into prompts.

use glob::glob;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::knowledge::KnowledgeStore;

/// Kind of device a manual describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Closed-loop dosing algorithm (CamAPS FX, Control-IQ, ...)
    Algorithm,
    Pump,
    Cgm,
    Unknown,
}

/// A detected user device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDevice {
    /// Human-readable name, e.g. "CamAPS FX"
    pub name: String,
    pub device_type: DeviceType,
    /// Knowledge store collection backing this device's documentation
    pub collection: String,
}

/// Filename/collection patterns mapped to clean device names.
/// Checked in order; first match wins.
static DEVICE_NAME_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let patterns: [(&str, &str); 18] = [
        // CamAPS FX ships under several document codes
        (r"camaps|cam.*aps|fx.*mmoll|manual.*fx|mmoll.*commercial|art46090", "CamAPS FX"),
        (r"omnipod.*5|op5|dash.*5", "Omnipod 5"),
        (r"omnipod.*dash|dash.*pump", "Omnipod DASH"),
        (r"control.*iq|tandem.*iq|t.*slim.*x2|tslim", "Tandem Control-IQ"),
        (r"780g|medtronic.*780|guardian.*4", "Medtronic 780G"),
        (r"770g|medtronic.*770", "Medtronic 770G"),
        (r"ilet|bionic.*pancreas", "iLet Bionic Pancreas"),
        (r"dexcom.*g7|g7.*cgm", "Dexcom G7"),
        (r"dexcom.*g6|g6.*cgm", "Dexcom G6"),
        (r"libre.*3|freestyle.*3", "FreeStyle Libre 3"),
        (r"libre.*2|freestyle.*2", "FreeStyle Libre 2"),
        (r"freestyle.*libre|libre", "FreeStyle Libre"),
        (r"guardian.*sensor|guardian.*cgm", "Medtronic Guardian"),
        (r"ypsopump|ypso|mylife.*ypso", "YpsoPump"),
        (r"loop.*app|loopkit", "Loop (DIY)"),
        (r"android.*aps|aaps", "AndroidAPS (DIY)"),
        (r"openaps|oref", "OpenAPS (DIY)"),
        (r"dana.*i|dana.*rs", "Dana-i"),
    ];
    patterns
        .into_iter()
        .map(|(p, name)| (Regex::new(&format!("(?i){p}")).expect("invalid regex"), name))
        .collect()
});

/// Filenames that are clinical documents, not device manuals.
const GUIDELINE_TOKENS: [&str; 5] = ["standards", "guidelines", "ada", "protocol", "clinical"];

/// Noise words stripped when no pattern matches a filename.
const NOISE_WORDS: [&str; 8] = [
    "manual", "user", "guide", "rev", "commercial", "mmoll", "mgdl", "ifu",
];

/// Match a filename or collection name against the device catalog.
pub fn match_device_pattern(name: &str) -> Option<&'static str> {
    DEVICE_NAME_PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.is_match(name))
        .map(|(_, clean)| *clean)
}

/// Produce a display name for a manual filename: catalog match first,
/// otherwise a cleaned-up title-cased stem.
pub fn display_name(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());

    if let Some(clean) = match_device_pattern(&stem) {
        return clean.to_string();
    }

    let spaced = stem.replace(['_', '-'], " ");
    let words: Vec<&str> = spaced
        .split_whitespace()
        .filter(|w| {
            let lower = w.to_lowercase();
            !NOISE_WORDS.contains(&lower.as_str()) && !is_doc_code(&lower)
        })
        .collect();
    if words.is_empty() {
        return title_case(&spaced);
    }
    title_case(&words.join(" "))
}

/// Revision markers like "r2" or "3027291" that carry no device identity.
fn is_doc_code(word: &str) -> bool {
    let mut chars = word.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => chars.all(|c| c.is_ascii_digit()),
        Some(c) if c.is_ascii_alphabetic() => {
            let rest: String = chars.collect();
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classify a clean device name into a device type.
pub fn detect_device_type(name: &str) -> DeviceType {
    let lower = name.to_lowercase();

    if ["camaps", "omnipod 5", "control-iq", "medtronic 780g", "ilet", "loop", "androidaps", "openaps"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return DeviceType::Algorithm;
    }
    if ["pump", "omnipod", "tandem", "medtronic", "ypsopump", "dana"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return DeviceType::Pump;
    }
    if ["dexcom", "libre", "guardian", "cgm", "sensor", "g6", "g7"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return DeviceType::Cgm;
    }
    DeviceType::Unknown
}

/// Registry of user-uploaded device documentation.
pub struct DeviceRegistry {
    sources_dir: PathBuf,
}

impl DeviceRegistry {
    pub fn new(sources_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources_dir: sources_dir.into(),
        }
    }

    /// Detect the user's devices from uploaded manuals and indexed
    /// collections. Duplicates (same display name) keep the first hit;
    /// clinical guideline documents are filtered out.
    pub async fn user_devices(&self, store: &dyn KnowledgeStore) -> Vec<UserDevice> {
        let mut devices = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();

        // Uploaded manuals first: they carry the user's own devices.
        for path in self.scan_manuals() {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let name = display_name(&file_name);

            if is_guideline_document(&name) {
                continue;
            }
            if !seen_names.insert(name.clone()) {
                continue;
            }

            let device_type = detect_device_type(&name);
            if device_type == DeviceType::Unknown {
                continue;
            }

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            devices.push(UserDevice {
                name,
                device_type,
                collection: format!("user_{}", stem.replace(['-', ' '], "_")),
            });
        }

        // Then any indexed collection that matches a device pattern.
        match store.collections().await {
            Ok(collections) => {
                for info in collections {
                    let Some(clean) = match_device_pattern(&info.name) else {
                        continue;
                    };
                    if !seen_names.insert(clean.to_string()) {
                        continue;
                    }
                    debug!(collection = %info.name, device = clean, "[devices] detected device collection");
                    devices.push(UserDevice {
                        name: clean.to_string(),
                        device_type: detect_device_type(clean),
                        collection: info.name,
                    });
                }
            }
            Err(e) => warn!("[devices] could not list collections: {e}"),
        }

        devices
    }

    /// The primary device is the first detection; prompts lead with it.
    pub async fn primary_device(&self, store: &dyn KnowledgeStore) -> Option<UserDevice> {
        self.user_devices(store).await.into_iter().next()
    }

    fn scan_manuals(&self) -> Vec<PathBuf> {
        let pattern = format!("{}/**/*.pdf", self.sources_dir.display());
        match glob(&pattern) {
            Ok(paths) => {
                let mut found: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
                found.sort();
                found
            }
            Err(e) => {
                warn!("[devices] bad manual glob: {e}");
                Vec::new()
            }
        }
    }
}

fn is_guideline_document(name: &str) -> bool {
    let lower = name.to_lowercase();
    GUIDELINE_TOKENS.iter().any(|t| lower.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::knowledge::{Chunk, CollectionInfo};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FixedStore(Vec<CollectionInfo>);

    #[async_trait]
    impl KnowledgeStore for FixedStore {
        async fn query(&self, _text: &str, _top_k: usize) -> Result<Vec<Chunk>> {
            Ok(Vec::new())
        }

        async fn collections(&self) -> Result<Vec<CollectionInfo>> {
            Ok(self.0.clone())
        }
    }

    fn collection(name: &str) -> CollectionInfo {
        CollectionInfo {
            name: name.to_string(),
            chunk_count: 1,
            last_indexed: None,
        }
    }

    #[test]
    fn test_pattern_match_first_wins() {
        assert_eq!(match_device_pattern("camaps_fx_manual"), Some("CamAPS FX"));
        assert_eq!(match_device_pattern("Art46090_mmoll"), Some("CamAPS FX"));
        assert_eq!(match_device_pattern("dexcom-g7-user-guide"), Some("Dexcom G7"));
        // "libre 3" must hit the Libre 3 row before the generic Libre row
        assert_eq!(match_device_pattern("freestyle_libre_3"), Some("FreeStyle Libre 3"));
        assert_eq!(match_device_pattern("random_notes"), None);
    }

    #[test]
    fn test_display_name_fallback_strips_noise() {
        assert_eq!(display_name("acme_glucose_manual_rev_r2.pdf"), "Acme Glucose");
    }

    #[test]
    fn test_device_type_classification() {
        assert_eq!(detect_device_type("CamAPS FX"), DeviceType::Algorithm);
        assert_eq!(detect_device_type("Dana-i"), DeviceType::Pump);
        assert_eq!(detect_device_type("Dexcom G6"), DeviceType::Cgm);
        assert_eq!(detect_device_type("Wellness Handbook"), DeviceType::Unknown);
    }

    #[tokio::test]
    async fn test_devices_from_collections_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path());
        let store = FixedStore(vec![
            collection("user_camaps_fx_manual"),
            collection("camaps_fx_mmoll_commercial"),
            collection("dexcom_g6_user_guide"),
            collection("ada_standards_2026"),
        ]);

        let devices = registry.user_devices(&store).await;
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["CamAPS FX", "Dexcom G6"]);
    }

    #[tokio::test]
    async fn test_manual_scan_filters_guidelines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("camaps_fx_manual.pdf"), b"pdf").unwrap();
        std::fs::write(dir.path().join("ada_standards_2026.pdf"), b"pdf").unwrap();

        let registry = DeviceRegistry::new(dir.path());
        let store = FixedStore(Vec::new());
        let devices = registry.user_devices(&store).await;

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "CamAPS FX");
        assert_eq!(devices[0].device_type, DeviceType::Algorithm);
        assert_eq!(devices[0].collection, "user_camaps_fx_manual");
    }

    #[tokio::test]
    async fn test_primary_device_is_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("camaps_fx_manual.pdf"), b"pdf").unwrap();
        std::fs::write(dir.path().join("dexcom_g6.pdf"), b"pdf").unwrap();

        let registry = DeviceRegistry::new(dir.path());
        let store = FixedStore(Vec::new());
        let primary = registry.primary_device(&store).await.unwrap();
        assert_eq!(primary.name, "CamAPS FX");
    }
}
