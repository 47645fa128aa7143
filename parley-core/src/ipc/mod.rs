//! Wire and host-facing event types.
//!
//! Everything derives `serde::Serialize` + `serde::Deserialize` so a host
//! can carry it over whatever transport it owns (JSON lines in `parley-app`).

pub mod events;
