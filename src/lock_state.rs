//! Binary layout of lock files.  A lock file starts with a small
//! *state region* (protocol byte, then the dirty/clean state), followed
//! by an *information region* where the exclusive holder advertises
//! its pid, lock id, contention port, and current operation.
//!
//! The state region is the only cross-process crash-recovery signal:
//! writers mark it dirty before touching the data it protects, and
//! clean once done.  A fresh lock file starts dirty, so brand new
//! caches always go through initialisation.
use std::convert::TryInto;

use crate::error::Error;
use crate::error::Result;

/// The state region always starts at the beginning of the lock file.
pub const STATE_REGION_POS: u64 = 0;

/// Bytes reserved for the information region, right after the state
/// region.
pub const INFORMATION_REGION_SIZE: u64 = 2052;

const INFORMATION_PROTOCOL_VERSION: u8 = 3;

/// Longest pid or operation description we store, in chars.
const INFORMATION_STRING_CHARS: usize = 340;

/// Hard cap in bytes, so that two strings and their framing always fit
/// in `INFORMATION_REGION_SIZE`.
const INFORMATION_STRING_BYTES: usize = 1000;

/// What we know about the state of the data guarded by a lock file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Current format.  `sequence_number` is negative while an update
    /// is in flight, and otherwise increases by one with each clean
    /// update.  `creation_number` identifies this incarnation of the
    /// lock file.
    Sequence {
        creation_number: i64,
        sequence_number: i64,
        previous_sequence_number: i64,
    },
    /// Legacy cross-version format: a single dirty flag.
    DirtyFlag { dirty: bool },
}

impl LockState {
    pub fn is_dirty(&self) -> bool {
        match *self {
            LockState::Sequence {
                sequence_number, ..
            } => sequence_number < 0,
            LockState::DirtyFlag { dirty } => dirty,
        }
    }

    /// Whether this state lets us notice updates made by other
    /// processes since we last saw it.
    pub fn can_detect_changes(&self) -> bool {
        matches!(self, LockState::Sequence { .. })
    }

    /// Returns true if the state has never seen a clean update.
    pub fn is_in_initial_state(&self) -> bool {
        match *self {
            LockState::Sequence {
                sequence_number,
                previous_sequence_number,
                ..
            } => sequence_number <= 0 && previous_sequence_number == 0,
            LockState::DirtyFlag { .. } => false,
        }
    }

    /// Returns whether the data may have changed between `other` and
    /// `self`.  States that cannot detect changes always answer yes.
    pub fn has_been_updated_since(&self, other: &LockState) -> bool {
        match (self, other) {
            (
                LockState::Sequence {
                    creation_number,
                    sequence_number,
                    ..
                },
                LockState::Sequence {
                    creation_number: other_creation,
                    sequence_number: other_sequence,
                    ..
                },
            ) => creation_number != other_creation || sequence_number != other_sequence,
            _ => true,
        }
    }

    /// Returns the state to persist before a mutation starts.  The dirty
    /// sequence number encodes the last clean one, so that recovering
    /// from a crash never reuses a sequence number.
    pub(crate) fn before_update(&self) -> LockState {
        match *self {
            LockState::Sequence {
                creation_number,
                sequence_number,
                previous_sequence_number,
            } => {
                let previous = if sequence_number >= 0 {
                    sequence_number
                } else {
                    previous_sequence_number
                };
                LockState::Sequence {
                    creation_number,
                    sequence_number: dirty_sequence_number(previous),
                    previous_sequence_number: previous,
                }
            }
            LockState::DirtyFlag { .. } => LockState::DirtyFlag { dirty: true },
        }
    }

    /// Returns the state to persist once a mutation is complete.
    pub(crate) fn complete_update(&self) -> LockState {
        match *self {
            LockState::Sequence {
                creation_number,
                previous_sequence_number,
                ..
            } => {
                let next = previous_sequence_number.saturating_add(1);
                LockState::Sequence {
                    creation_number,
                    sequence_number: next,
                    previous_sequence_number: next,
                }
            }
            LockState::DirtyFlag { .. } => LockState::DirtyFlag { dirty: false },
        }
    }
}

/// Selects the state region encoding.  Both formats start with their
/// protocol version byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockStateProtocol {
    /// Creation number and sequence number, protocol version 3.
    Default,
    /// A single dirty byte, protocol version 1.  Understood by every
    /// version of the lock file format.
    CrossVersion,
}

impl LockStateProtocol {
    pub fn version(self) -> u8 {
        match self {
            LockStateProtocol::Default => 3,
            LockStateProtocol::CrossVersion => 1,
        }
    }

    /// Size of the state region, including the protocol byte.
    pub fn region_size(self) -> u64 {
        match self {
            LockStateProtocol::Default => 1 + 8 + 8,
            LockStateProtocol::CrossVersion => 1 + 1,
        }
    }

    /// Offset of the information region for this protocol.
    pub fn information_region_pos(self) -> u64 {
        STATE_REGION_POS + self.region_size()
    }

    /// Returns the (dirty) state of a lock file that was just created.
    pub fn initial_state(self) -> LockState {
        match self {
            LockStateProtocol::Default => LockState::Sequence {
                creation_number: rand::random::<i64>(),
                sequence_number: -1,
                previous_sequence_number: 0,
            },
            LockStateProtocol::CrossVersion => LockState::DirtyFlag { dirty: true },
        }
    }

    pub fn encode(self, state: &LockState) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.region_size() as usize);
        out.push(self.version());

        match self {
            LockStateProtocol::Default => {
                let (creation, sequence) = match *state {
                    LockState::Sequence {
                        creation_number,
                        sequence_number,
                        ..
                    } => (creation_number, sequence_number),
                    LockState::DirtyFlag { dirty } => (0, if dirty { -1 } else { 0 }),
                };
                out.extend_from_slice(&creation.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
            }
            LockStateProtocol::CrossVersion => out.push(state.is_dirty() as u8),
        }

        out
    }

    /// Decodes a full state region.
    pub fn decode(self, region: &[u8]) -> Result<LockState> {
        if region.len() < self.region_size() as usize {
            return Err(Error::illegal_state(format!(
                "Lock state region is truncated: expected {} bytes, found {}.",
                self.region_size(),
                region.len()
            )));
        }

        if region[0] != self.version() {
            return Err(Error::UnexpectedLockProtocol {
                expected: self.version(),
                found: region[0],
            });
        }

        match self {
            LockStateProtocol::Default => {
                let creation_number = read_i64(&region[1..9]);
                let sequence_number = read_i64(&region[9..17]);
                Ok(LockState::Sequence {
                    creation_number,
                    sequence_number,
                    previous_sequence_number: last_clean_sequence_number(sequence_number),
                })
            }
            LockStateProtocol::CrossVersion => Ok(LockState::DirtyFlag {
                dirty: region[1] != 0,
            }),
        }
    }
}

/// Dirty sequence numbers are `-(last clean + 1)`; a lock file that was
/// never clean holds -1.
fn dirty_sequence_number(last_clean: i64) -> i64 {
    last_clean.saturating_add(1).saturating_neg()
}

fn last_clean_sequence_number(sequence_number: i64) -> i64 {
    if sequence_number >= 0 {
        sequence_number
    } else {
        sequence_number.saturating_add(1).saturating_neg().max(0)
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    i64::from_be_bytes(raw)
}

/// Details about the current exclusive holder of a lock file, as
/// advertised in the information region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    /// Port on which the holder listens for contention pings, or -1.
    pub port: i32,
    pub lock_id: i64,
    pub pid: String,
    pub operation: String,
}

impl Default for LockInfo {
    fn default() -> LockInfo {
        LockInfo {
            port: -1,
            lock_id: -1,
            pid: "unknown".to_owned(),
            operation: "unknown".to_owned(),
        }
    }
}

/// Cuts `value` down to `INFORMATION_STRING_CHARS` chars, and never
/// more than `INFORMATION_STRING_BYTES` bytes.
fn truncate(value: &str) -> &str {
    let mut end = value
        .char_indices()
        .nth(INFORMATION_STRING_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or_else(|| value.len());

    end = end.min(INFORMATION_STRING_BYTES);
    while !value.is_char_boundary(end) {
        end -= 1;
    }

    &value[..end]
}

fn push_string(out: &mut Vec<u8>, value: &str) {
    let value = truncate(value);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

/// Reads a length-prefixed string at `*pos`, advancing the cursor.
fn pop_string(region: &[u8], pos: &mut usize) -> Result<String> {
    let truncated = || Error::illegal_state("Lock information region is truncated.");

    let len_bytes: [u8; 2] = region
        .get(*pos..*pos + 2)
        .ok_or_else(truncated)?
        .try_into()
        .map_err(|_| truncated())?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    *pos += 2;

    let bytes = region.get(*pos..*pos + len).ok_or_else(truncated)?;
    *pos += len;

    Ok(String::from_utf8_lossy(bytes).into_owned())
}

impl LockInfo {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);

        out.push(INFORMATION_PROTOCOL_VERSION);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.lock_id.to_be_bytes());
        push_string(&mut out, &self.pid);
        push_string(&mut out, &self.operation);

        assert!(out.len() as u64 <= INFORMATION_REGION_SIZE);
        out
    }

    pub fn decode(region: &[u8]) -> Result<LockInfo> {
        if region.len() < 13 {
            return Err(Error::illegal_state("Lock information region is truncated."));
        }

        if region[0] != INFORMATION_PROTOCOL_VERSION {
            return Err(Error::UnexpectedLockProtocol {
                expected: INFORMATION_PROTOCOL_VERSION,
                found: region[0],
            });
        }

        let mut port = [0u8; 4];
        port.copy_from_slice(&region[1..5]);
        let lock_id = read_i64(&region[5..13]);

        let mut pos = 13;
        let pid = pop_string(region, &mut pos)?;
        let operation = pop_string(region, &mut pos)?;

        Ok(LockInfo {
            port: i32::from_be_bytes(port),
            lock_id,
            pid,
            operation,
        })
    }
}

#[cfg(test)]
mod test {
    use crate::lock_state::*;

    /// New lock files must look like they crashed mid-update.
    #[test]
    fn initial_state_is_dirty() {
        assert!(LockStateProtocol::Default.initial_state().is_dirty());
        assert!(LockStateProtocol::CrossVersion.initial_state().is_dirty());
        assert!(LockStateProtocol::Default.initial_state().is_in_initial_state());
    }

    #[test]
    fn update_cycle_bumps_sequence() {
        let initial = LockStateProtocol::Default.initial_state();
        let dirty = initial.before_update();
        assert!(dirty.is_dirty());

        let clean = dirty.complete_update();
        assert!(!clean.is_dirty());
        assert!(!clean.is_in_initial_state());
        assert!(clean.has_been_updated_since(&initial));

        let again = clean.before_update().complete_update();
        assert!(again.has_been_updated_since(&clean));
        assert!(!again.has_been_updated_since(&again));

        match (clean, again) {
            (
                LockState::Sequence {
                    sequence_number: first,
                    ..
                },
                LockState::Sequence {
                    sequence_number: second,
                    ..
                },
            ) => assert_eq!(second, first + 1),
            _ => panic!("default protocol must produce sequence states"),
        }
    }

    /// A dirty state persisted to disk stays dirty when read back.
    #[test]
    fn dirty_survives_encoding() {
        for protocol in [LockStateProtocol::Default, LockStateProtocol::CrossVersion] {
            let dirty = protocol.initial_state().before_update();
            let decoded = protocol
                .decode(&protocol.encode(&dirty))
                .expect("decode must succeed");
            assert!(decoded.is_dirty());

            let clean = dirty.complete_update();
            let decoded = protocol
                .decode(&protocol.encode(&clean))
                .expect("decode must succeed");
            assert!(!decoded.is_dirty());
        }
    }

    /// Recovering from a crash read back from disk moves past every
    /// sequence number another process may have seen, and does not look
    /// like a brand new lock file.
    #[test]
    fn crash_recovery_never_reuses_a_sequence_number() {
        let protocol = LockStateProtocol::Default;
        let mut seen = protocol.initial_state().before_update().complete_update();
        for _ in 0..4 {
            seen = seen.before_update().complete_update();
        }

        let crashed = protocol
            .decode(&protocol.encode(&seen.before_update()))
            .expect("decode must succeed");
        assert!(crashed.is_dirty());
        assert!(!crashed.is_in_initial_state());

        let recovered = protocol
            .decode(&protocol.encode(&crashed.before_update().complete_update()))
            .expect("decode must succeed");
        assert!(!recovered.is_dirty());
        assert!(recovered.has_been_updated_since(&seen));
        match (seen, recovered) {
            (
                LockState::Sequence {
                    sequence_number: before,
                    ..
                },
                LockState::Sequence {
                    sequence_number: after,
                    ..
                },
            ) => assert_eq!(after, before + 1),
            _ => panic!("default protocol must produce sequence states"),
        }

        let fresh = protocol
            .decode(&protocol.encode(&protocol.initial_state()))
            .expect("decode must succeed");
        assert!(fresh.is_in_initial_state());
    }

    #[test]
    fn cross_version_cannot_detect_changes() {
        let state = LockState::DirtyFlag { dirty: false };
        assert!(!state.can_detect_changes());
        assert!(state.has_been_updated_since(&state));
    }

    #[test]
    fn protocol_mismatch_is_reported() {
        let encoded = LockStateProtocol::CrossVersion.encode(&LockState::DirtyFlag { dirty: false });
        let mut padded = encoded.clone();
        padded.resize(LockStateProtocol::Default.region_size() as usize, 0);

        assert!(matches!(
            LockStateProtocol::Default.decode(&padded),
            Err(Error::UnexpectedLockProtocol {
                expected: 3,
                found: 1
            })
        ));
    }

    /// Long operation names are cut so the region never overflows.
    #[test]
    fn lock_info_truncates_long_strings() {
        let info = LockInfo {
            port: 1234,
            lock_id: 42,
            pid: "77".to_owned(),
            operation: "é".repeat(2000),
        };

        let encoded = info.encode();
        assert!(encoded.len() as u64 <= INFORMATION_REGION_SIZE);

        let decoded = LockInfo::decode(&encoded).expect("decode must succeed");
        assert_eq!(decoded.operation.chars().count(), 340);

        // Wide chars hit the byte cap first.
        let info = LockInfo {
            port: 1234,
            lock_id: 42,
            pid: "\u{1F600}".repeat(400),
            operation: "\u{1F600}".repeat(400),
        };

        let encoded = info.encode();
        assert!(encoded.len() as u64 <= INFORMATION_REGION_SIZE);

        let decoded = LockInfo::decode(&encoded).expect("decode must succeed");
        assert_eq!(decoded.port, 1234);
        assert_eq!(decoded.lock_id, 42);
        assert_eq!(decoded.pid.chars().count(), 250);
        assert_eq!(decoded.operation.len(), 1000);
    }

    #[test]
    fn lock_info_rejects_truncated_region() {
        assert!(LockInfo::decode(&[3, 0, 0]).is_err());
    }
}
