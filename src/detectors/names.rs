// Display names. They appear in reports, select verdict rules and populate
// the default core-detector set, so they are part of the external contract.

pub const PHASH_BLOCKLIST: &str = "pHash blocklist";
pub const PHASH_ALLOWLIST: &str = "pHash allowlist";
pub const OCR: &str = "OCR text";
pub const NUDENET: &str = "NudeNet";
pub const OPENNSFW2: &str = "OpenNSFW2";
pub const YOLO_WEAPONS: &str = "YOLO-World weapons";
pub const OPENAI: &str = "OpenAI Moderation";
pub const SIGHTENGINE: &str = "Sightengine";

/// Pseudo-detector reported when an input can't be decoded.
pub const LOADER: &str = "Loader";
