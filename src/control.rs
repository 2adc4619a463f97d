//! In-process control surface.
//!
//! External control shells (out of scope here) drive the daemon through
//! these calls: adjusting the log level, narrowing logging to a set of
//! facilities, and liveness pings. A facility is a module-path prefix;
//! with a non-empty facility set only matching targets are considered
//! enabled by [`facility_enabled`].

use std::collections::HashSet;

use log::{info, LevelFilter};
use parking_lot::RwLock;
use std::sync::LazyLock;

static FACILITIES: LazyLock<RwLock<HashSet<String>>> =
    LazyLock::new(|| RwLock::new(HashSet::new()));

/// Set the global log level.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
    info!("log level set to {level}");
}

/// Current global log level.
pub fn level() -> LevelFilter {
    log::max_level()
}

/// Restrict logging to `facility` (additively).
pub fn set_facility(facility: &str) {
    FACILITIES.write().insert(facility.to_owned());
    info!("facility {facility} enabled");
}

/// Remove `facility` from the restriction set; an empty set means all
/// facilities are enabled.
pub fn reset_facility(facility: &str) {
    FACILITIES.write().remove(facility);
    info!("facility {facility} reset");
}

/// Whether `target` passes the facility restriction.
pub fn facility_enabled(target: &str) -> bool {
    let facilities = FACILITIES.read();
    facilities.is_empty()
        || facilities
            .iter()
            .any(|facility| target.starts_with(facility.as_str()))
}

/// Liveness probe.
pub fn ping() -> &'static str {
    "pong"
}
