//! IP -> port side-store remembering which port of a device was last
//! reachable. Entries expire after a TTL (24 h by default).

mod open;
mod schema;
mod store;

pub use open::{LastSeen, DEFAULT_TTL};
