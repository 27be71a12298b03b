//! Stream port derivation.
//!
//! Every camera owns a pair of consecutive ports derived from its stream
//! index: the input (raw) stream on `1181 + 2 * index` and the annotated
//! output stream right after it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, VisionError};

/// Port of stream index 0
pub const BASE_PORT: u16 = 1181;

/// Input/output port pair of one camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPorts {
    pub input: u16,
    pub output: u16,
}

impl StreamPorts {
    /// Derive the port pair for a stream index.
    pub fn for_stream_index(stream_index: u32) -> Result<Self> {
        let out_of_range = || {
            VisionError::invalid(
                "stream_index",
                format!("{} maps outside the port range", stream_index),
            )
        };
        let input = stream_index
            .checked_mul(2)
            .and_then(|offset| offset.checked_add(u32::from(BASE_PORT)))
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(out_of_range)?;
        let output = input.checked_add(1).ok_or_else(out_of_range)?;
        Ok(Self { input, output })
    }
}

/// Fail on the first two cameras sharing a stream index.
pub fn check_port_conflicts<'a>(
    cameras: impl IntoIterator<Item = (&'a str, u32)>,
) -> Result<()> {
    let mut seen: HashMap<u32, &str> = HashMap::new();
    for (name, stream_index) in cameras {
        StreamPorts::for_stream_index(stream_index)?;
        if let Some(first) = seen.insert(stream_index, name) {
            return Err(VisionError::PortConflict {
                first: first.to_string(),
                second: name.to_string(),
                stream_index,
            });
        }
    }
    Ok(())
}

/// Lowest stream index not present in `used`.
pub fn next_free_stream_index(used: impl IntoIterator<Item = u32>) -> u32 {
    let mut used: Vec<u32> = used.into_iter().collect();
    used.sort_unstable();
    used.dedup();
    let mut candidate = 0;
    for index in used {
        if index != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_first_two_cameras() {
        let cam0 = StreamPorts::for_stream_index(0).unwrap();
        assert_eq!((cam0.input, cam0.output), (1181, 1182));
        let cam1 = StreamPorts::for_stream_index(1).unwrap();
        assert_eq!((cam1.input, cam1.output), (1183, 1184));
    }

    #[test]
    fn test_distinct_indices_give_disjoint_ports() {
        let mut ports = HashSet::new();
        for index in 0..500 {
            let pair = StreamPorts::for_stream_index(index).unwrap();
            assert!(ports.insert(pair.input), "input port reused at {}", index);
            assert!(ports.insert(pair.output), "output port reused at {}", index);
        }
    }

    #[test]
    fn test_index_out_of_range() {
        assert!(StreamPorts::for_stream_index(40_000).is_err());
        // 2^31 would wrap onto index 0's ports
        assert!(matches!(
            StreamPorts::for_stream_index(1 << 31),
            Err(VisionError::InvalidSettingValue { .. })
        ));
        assert!(StreamPorts::for_stream_index(u32::MAX).is_err());
        assert!(check_port_conflicts([("A", 0), ("B", 1 << 31)]).is_err());
        // Highest index whose output port still fits
        let last = StreamPorts::for_stream_index(32_176).unwrap();
        assert_eq!((last.input, last.output), (65_533, 65_534));
        assert!(StreamPorts::for_stream_index(32_177).is_err());
    }

    #[test]
    fn test_conflict_detected() {
        let err = check_port_conflicts([("Cam0", 0), ("Cam1", 1), ("Cam2", 1)]).unwrap_err();
        match err {
            VisionError::PortConflict {
                first,
                second,
                stream_index,
            } => {
                assert_eq!(first, "Cam1");
                assert_eq!(second, "Cam2");
                assert_eq!(stream_index, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_next_free_index_fills_gaps() {
        assert_eq!(next_free_stream_index([]), 0);
        assert_eq!(next_free_stream_index([0, 1, 2]), 3);
        assert_eq!(next_free_stream_index([0, 2, 3]), 1);
        assert_eq!(next_free_stream_index([1]), 0);
    }
}
