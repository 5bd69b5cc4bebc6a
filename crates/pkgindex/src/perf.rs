// perf.rs - Timing of cache builds, metadata lookups and workspace queries
//
// Set PKGINDEX_PERF to turn it on:
//   PKGINDEX_PERF=1        log how long each timed phase took
//   PKGINDEX_PERF=verbose  additionally warn about phases over their budget

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PerfLevel {
    Off,
    Timings,
    Verbose,
}

fn level() -> PerfLevel {
    static LEVEL: OnceLock<PerfLevel> = OnceLock::new();
    *LEVEL.get_or_init(|| parse_level(std::env::var("PKGINDEX_PERF").ok().as_deref()))
}

fn parse_level(value: Option<&str>) -> PerfLevel {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => PerfLevel::Off,
        Some(v) if v.is_empty() || v == "0" || v == "false" => PerfLevel::Off,
        Some(v) if v == "verbose" => PerfLevel::Verbose,
        Some(_) => PerfLevel::Timings,
    }
}

pub fn is_enabled() -> bool {
    level() != PerfLevel::Off
}

/// Phases of the engine that are worth timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Scanning the workspace for module files.
    Discovery,
    /// Creating every root builder and running their first build.
    Open,
    /// One loader call plus the store swap.
    BuildCache,
    /// Asking the module metadata source for dependencies.
    Metadata,
    /// Substring search over every stored symbol.
    SymbolSearch,
}

impl Phase {
    /// Duration past which verbose mode warns.
    pub fn budget(self) -> Duration {
        match self {
            Phase::Discovery => Duration::from_millis(500),
            Phase::Open => Duration::from_secs(10),
            Phase::BuildCache => Duration::from_secs(5),
            Phase::Metadata => Duration::from_secs(2),
            Phase::SymbolSearch => Duration::from_millis(200),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Discovery => "discovery",
            Phase::Open => "open",
            Phase::BuildCache => "build_cache",
            Phase::Metadata => "metadata",
            Phase::SymbolSearch => "search_symbols",
        })
    }
}

/// Logs the duration of a phase when dropped.
///
/// ```
/// use pkgindex::perf::{Phase, TimingGuard};
///
/// let _timing = TimingGuard::new(Phase::BuildCache, "/work/app");
/// ```
pub struct TimingGuard {
    phase: Phase,
    subject: String,
    start: Instant,
    armed: bool,
}

impl TimingGuard {
    /// `subject` names what the phase ran on: a root, a pattern or a query.
    pub fn new(phase: Phase, subject: impl fmt::Display) -> Self {
        let armed = is_enabled();
        Self {
            phase,
            // Skip the allocation when nothing will be logged.
            subject: if armed { subject.to_string() } else { String::new() },
            start: Instant::now(),
            armed,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timing without logging.
    pub fn finish(mut self) -> Duration {
        self.armed = false;
        self.start.elapsed()
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let elapsed = self.start.elapsed();
        log::info!("[PERF] {} {} took {:?}", self.phase, self.subject, elapsed);
        if level() == PerfLevel::Verbose && elapsed > self.phase.budget() {
            log::warn!(
                "[PERF] {} {} over budget ({:?} > {:?})",
                self.phase,
                self.subject,
                elapsed,
                self.phase.budget()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(None), PerfLevel::Off);
        assert_eq!(parse_level(Some("")), PerfLevel::Off);
        assert_eq!(parse_level(Some("0")), PerfLevel::Off);
        assert_eq!(parse_level(Some("False")), PerfLevel::Off);
        assert_eq!(parse_level(Some("1")), PerfLevel::Timings);
        assert_eq!(parse_level(Some(" VERBOSE ")), PerfLevel::Verbose);
    }

    #[test]
    fn test_finish_reports_elapsed() {
        let guard = TimingGuard::new(Phase::Metadata, "go list");
        std::thread::sleep(Duration::from_millis(10));
        assert!(guard.finish() >= Duration::from_millis(10));
    }

    #[test]
    fn test_search_budget_is_tighter_than_build() {
        assert!(Phase::SymbolSearch.budget() < Phase::BuildCache.budget());
        assert_eq!(Phase::BuildCache.to_string(), "build_cache");
    }
}
