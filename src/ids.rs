//! Fixed 8-byte identifiers: object ids (`Oid`) and transaction/serial ids
//! (`Tid`). Both are big-endian on disk and render as 16 uppercase hex
//! characters in their canonical textual form.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ID_LEN: usize = 8;

macro_rules! fixed_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            pub const ZERO: $name = $name([0u8; ID_LEN]);

            pub fn from_u64(v: u64) -> Self {
                $name(v.to_be_bytes())
            }

            pub fn as_u64(&self) -> u64 {
                u64::from_be_bytes(self.0)
            }

            pub fn from_bytes(b: &[u8]) -> Option<Self> {
                if b.len() != ID_LEN {
                    return None;
                }
                let mut a = [0u8; ID_LEN];
                a.copy_from_slice(b);
                Some($name(a))
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Canonical textual form: 16 uppercase hex characters.
            pub fn to_hex(&self) -> String {
                let mut s = String::with_capacity(16);
                for byte in self.0.iter() {
                    s.push_str(&format!("{:02X}", byte));
                }
                s
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                if s.len() != 16 {
                    return None;
                }
                let mut out = [0u8; ID_LEN];
                for i in 0..ID_LEN {
                    out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
                }
                Some($name(out))
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; ID_LEN]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::ZERO
            }
        }
    };
}

fixed_id!(Oid);
fixed_id!(Tid);

impl Tid {
    /// Smallest value strictly greater than `self`. Used for tie-breaking
    /// when the wall clock has not advanced since the previous TID.
    pub fn succ(&self) -> Tid {
        Tid::from_u64(self.as_u64().wrapping_add(1))
    }
}

/// Generates monotonically increasing, calendar-derived TIDs.
///
/// Each TID encodes microseconds since the Unix epoch in its low 56 bits
/// (the high byte is left free so the clock never wraps in practice). If
/// two calls land in the same microsecond, or the wall clock moves
/// backwards, the clock falls back to incrementing the previous value by
/// one, preserving strict monotonicity.
pub struct TidClock {
    last: AtomicU64,
}

impl TidClock {
    pub fn new() -> Self {
        TidClock { last: AtomicU64::new(0) }
    }

    /// Seeds the clock so that every subsequently generated TID is
    /// strictly greater than `floor`. Called at open time with the
    /// store's last committed TID.
    pub fn seed(&self, floor: Tid) {
        self.last.fetch_max(floor.as_u64(), Ordering::SeqCst);
    }

    pub fn next(&self) -> Tid {
        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = if now_micros > prev { now_micros } else { prev + 1 };
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Tid::from_u64(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

impl Default for TidClock {
    fn default() -> Self {
        TidClock::new()
    }
}
