//! Coordinator configuration.

/// Server-level settings for index builds.
#[derive(Clone, Debug)]
pub struct IndexBuildsConfig {
    /// Gates the two-phase protocol's replication records. When false, a
    /// build registered as two-phase still runs its phase machine, but no
    /// `startIndexBuild` / `commitIndexBuild` / `abortIndexBuild` records are
    /// written (compatibility with mixed-version replica sets).
    pub enable_two_phase_index_builds: bool,
}

impl Default for IndexBuildsConfig {
    fn default() -> Self {
        Self {
            enable_two_phase_index_builds: true,
        }
    }
}
