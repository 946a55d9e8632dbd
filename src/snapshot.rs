//! Lightweight snapshot system
//!
//! Captures device and hart interrupt state (not RAM) so a run can be
//! saved and restored. Encoding is bincode compressed with zstd.

use serde::{Deserialize, Serialize};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
pub struct MarkerSnapshot {
    pub wid: u32,
    pub lock: u32,
}

#[derive(Serialize, Deserialize)]
pub struct HartSnapshot {
    pub mip: u32,
    /// World marker, when the machine carries a world guard.
    pub marker: Option<MarkerSnapshot>,
}

#[derive(Serialize, Deserialize)]
pub struct ClintSnapshot {
    pub mtime: u64,
    pub mtimecmp: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct PlicSnapshot {
    pub source_priority: Vec<u32>,
    pub target_priority: Vec<u32>,
    pub pending: Vec<u32>,
    pub claimed: Vec<u32>,
    pub enable: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct SystemSnapshot {
    /// Version for compatibility checking
    pub version: u32,
    pub harts: Vec<HartSnapshot>,
    pub clint: ClintSnapshot,
    pub plic: PlicSnapshot,
}

impl SystemSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let serialized =
            bincode::serialize(self).map_err(|e| format!("Serialization error: {}", e))?;
        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| format!("Compression error: {}", e))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let decompressed =
            zstd::stream::decode_all(data).map_err(|e| format!("Decompression error: {}", e))?;
        let snap: SystemSnapshot = bincode::deserialize(&decompressed)
            .map_err(|e| format!("Deserialization error: {}", e))?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(format!("Snapshot version mismatch: {}", snap.version));
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_round_trip() {
        let snap = SystemSnapshot {
            version: SNAPSHOT_VERSION,
            harts: vec![HartSnapshot {
                mip: 0x80,
                marker: Some(MarkerSnapshot { wid: 2, lock: 1 }),
            }],
            clint: ClintSnapshot {
                mtime: 0x1234,
                mtimecmp: vec![0x100],
            },
            plic: PlicSnapshot {
                source_priority: vec![0, 3, 5],
                target_priority: vec![0],
                pending: vec![0b110],
                claimed: vec![0],
                enable: vec![0b110],
            },
        };

        let bytes = snap.to_bytes().unwrap();
        assert!(!bytes.is_empty());
        let restored = SystemSnapshot::from_bytes(&bytes).unwrap();
        assert_eq!(restored.clint.mtime, 0x1234);
        assert_eq!(restored.plic.source_priority, vec![0, 3, 5]);
        assert_eq!(restored.harts[0].mip, 0x80);
        assert_eq!(restored.harts[0].marker.as_ref().unwrap().wid, 2);
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let snap = SystemSnapshot {
            version: SNAPSHOT_VERSION + 1,
            harts: Vec::new(),
            clint: ClintSnapshot {
                mtime: 0,
                mtimecmp: Vec::new(),
            },
            plic: PlicSnapshot {
                source_priority: Vec::new(),
                target_priority: Vec::new(),
                pending: Vec::new(),
                claimed: Vec::new(),
                enable: Vec::new(),
            },
        };
        let bytes = snap.to_bytes().unwrap();
        assert!(SystemSnapshot::from_bytes(&bytes).is_err());
    }
}
