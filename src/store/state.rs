//! The persisted bucket record.

use crate::error::{FleetrateError, Result};
use crate::key::LimiterKey;

use super::StateStore;

/// Field holding the bucket capacity.
pub const MAX_PERMITS: &str = "maxPermits";
/// Field holding the banked tokens.
pub const STORED_PERMITS: &str = "storedPermits";
/// Field holding the instant before which no new permit is free.
pub const NEXT_FREE_TICKET_MICROS: &str = "nextFreeTicketMicros";

const FIELDS: [&str; 3] = [MAX_PERMITS, STORED_PERMITS, NEXT_FREE_TICKET_MICROS];

/// One limiter's shared state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterState {
    /// Maximum tokens the bucket may hold; `+∞` until a rate is first set
    pub max_permits: f64,
    /// Tokens currently banked, between zero and `max_permits`
    pub stored_permits: f64,
    /// Absolute microsecond timestamp before which no new permit is free
    pub next_free_ticket_micros: i64,
}

impl Default for LimiterState {
    /// The state of a key nobody has configured yet.
    fn default() -> Self {
        Self {
            max_permits: f64::INFINITY,
            stored_permits: 0.0,
            next_free_ticket_micros: 0,
        }
    }
}

impl LimiterState {
    /// Whether a rate has ever been applied to this record.
    pub fn is_configured(&self) -> bool {
        self.max_permits.is_finite()
    }

    /// Read the record for `key`. Absent fields take their defaults; present
    /// but unparseable fields are an error.
    pub async fn load<S>(store: &S, key: &LimiterKey) -> Result<Self>
    where
        S: StateStore + ?Sized,
    {
        let values = store.hash_get(key.state_key(), &FIELDS).await?;
        if values.len() != FIELDS.len() {
            return Err(FleetrateError::Protocol(format!(
                "expected {} fields for '{}', got {}",
                FIELDS.len(),
                key,
                values.len()
            )));
        }

        let defaults = Self::default();
        Ok(Self {
            max_permits: parse_field(key, MAX_PERMITS, values[0].as_deref())?
                .unwrap_or(defaults.max_permits),
            stored_permits: parse_field(key, STORED_PERMITS, values[1].as_deref())?
                .unwrap_or(defaults.stored_permits),
            next_free_ticket_micros: parse_field(
                key,
                NEXT_FREE_TICKET_MICROS,
                values[2].as_deref(),
            )?
            .unwrap_or(defaults.next_free_ticket_micros),
        })
    }

    /// Write every field of the record in one store call.
    pub async fn save<S>(&self, store: &S, key: &LimiterKey) -> Result<()>
    where
        S: StateStore + ?Sized,
    {
        store
            .hash_set(
                key.state_key(),
                &[
                    (MAX_PERMITS, self.max_permits.to_string()),
                    (STORED_PERMITS, self.stored_permits.to_string()),
                    (
                        NEXT_FREE_TICKET_MICROS,
                        self.next_free_ticket_micros.to_string(),
                    ),
                ],
            )
            .await
    }
}

fn parse_field<T: std::str::FromStr>(
    key: &LimiterKey,
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<T>> {
    match raw.map(str::trim) {
        None | Some("") | Some("null") => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| FleetrateError::CorruptState {
                key: key.to_string(),
                field,
                value: value.to_string(),
            }),
    }
}
