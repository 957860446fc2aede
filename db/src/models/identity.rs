use rand::Rng;
use serde::{Deserialize, Serialize};

pub const VENDORS: &[&str] = &["ASUS", "MSI", "GIGABYTE", "ASRock", "EVGA"];

pub const BOARD_MODELS: &[&str] = &[
    "ROG STRIX",
    "TUF GAMING",
    "PRIME",
    "PRO",
    "GAMING EDGE",
    "TOMAHAWK",
    "MORTAR",
    "AORUS",
    "GAMING",
    "UD",
    "Phantom Gaming",
    "Steel Legend",
];

pub const DISK_MODELS: &[&str] = &[
    "Samsung SSD 970",
    "Samsung SSD 980",
    "WD Blue",
    "Crucial MX500",
    "Kingston A2000",
    "Seagate Barracuda",
];

pub const CPU_VENDORS: &[&str] = &["GenuineIntel", "AuthenticAMD"];

const SERIAL_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

const SERIAL_LEN: usize = 12;
const DISK_SERIAL_LEN: usize = 20;
const CODE_SEGMENTS: usize = 4;
const CODE_SEGMENT_LEN: usize = 8;

/// One synthetic hardware profile.
///
/// Everything except `machine_code` is fixed when the profile is generated.
/// `machine_code` stays `None` until an activation under this profile
/// succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Catalog-unique id. `0` means "not yet assigned"; the catalog assigns
    /// one on insertion.
    #[serde(default)]
    pub id: u32,

    pub vendor: String,
    pub version: String,
    pub date: String,
    pub manufacturer: String,
    pub product_name: String,
    pub serial_number: String,

    /// 16 random bytes, hex encoded.
    pub system_uuid: String,

    pub board_serial: String,
    pub disk_serial: String,
    pub disk_model: String,
    pub disk_revision: String,

    /// CPU vendor string, e.g. `GenuineIntel`.
    pub cpuid_0: String,

    /// Processor signature, e.g. `0x00906EA1`.
    pub cpuid_1: String,

    #[serde(rename = "virtual_machine_code")]
    pub virtual_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_code: Option<String>,
}

impl Identity {
    /// Generate a random profile with id `0` (unassigned).
    pub fn generate() -> Self {
        let mut rng = rand::rng();

        let vendor = pick(&mut rng, VENDORS);
        let board = pick(&mut rng, BOARD_MODELS);

        let mut uuid = [0u8; 16];
        rng.fill(&mut uuid);

        Self {
            id: 0,
            vendor: vendor.to_string(),
            version: format!("{}.{}", rng.random_range(1..=9), rng.random_range(0..=99)),
            date: format!(
                "{:02}/{:02}/20{}",
                rng.random_range(1..=12),
                rng.random_range(1..=28),
                rng.random_range(20..=24)
            ),
            manufacturer: vendor.to_string(),
            product_name: format!("{vendor} {board}"),
            serial_number: random_serial(SERIAL_LEN),
            system_uuid: hex::encode(uuid),
            board_serial: random_serial(SERIAL_LEN),
            disk_serial: random_serial(DISK_SERIAL_LEN),
            disk_model: pick(&mut rng, DISK_MODELS).to_string(),
            disk_revision: format!("{}.{}", rng.random_range(1..=9), rng.random_range(0..=9)),
            cpuid_0: pick(&mut rng, CPU_VENDORS).to_string(),
            cpuid_1: format!("0x{:08X}", rng.random_range(0x0080_0000u32..=0x00FF_FFFF)),
            virtual_code: random_virtual_code(),
            machine_code: None,
        }
    }

    /// Whether an activation has ever succeeded under this profile.
    pub fn is_registered(&self) -> bool {
        self.machine_code.is_some()
    }
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, choices: &[&'a str]) -> &'a str {
    choices[rng.random_range(0..choices.len())]
}

/// Random uppercase alphanumeric string of exactly `len` characters.
pub fn random_serial(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| SERIAL_CHARSET[rng.random_range(0..SERIAL_CHARSET.len())] as char)
        .collect()
}

/// Four random 8-character segments joined by hyphens.
pub fn random_virtual_code() -> String {
    (0..CODE_SEGMENTS)
        .map(|_| random_serial(CODE_SEGMENT_LEN))
        .collect::<Vec<_>>()
        .join("-")
}

/// Checks `code` against `XXXXXXXX-XXXXXXXX-XXXXXXXX-XXXXXXXX` where every
/// `X` is `A-Z` or `0-9`.
pub fn is_valid_virtual_code(code: &str) -> bool {
    let segments: Vec<&str> = code.split('-').collect();
    segments.len() == CODE_SEGMENTS
        && segments.iter().all(|segment| {
            segment.len() == CODE_SEGMENT_LEN
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        })
}
