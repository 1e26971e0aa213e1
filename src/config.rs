use core::fmt;
use std::time::Duration;

use crate::base::utils::read_uint_from_env;

/// Tunables of a [`Threads`](crate::Threads) registry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ThreadsConfig {
    /// Signal used to suspend threads (Unix only).
    pub suspend_signal: i32,
    /// Signal used to resume threads (Unix only).
    pub resume_signal: i32,
    /// Initial capacity of the pending-start buffer. Zero allocates on the
    /// first thread start.
    pub pending_start_capacity: usize,
    /// Suspensions that take longer than this are reported with a warning
    /// once the world runs again. Waiting never gives up.
    pub suspend_warn_after: Duration,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            suspend_signal: default_suspend_signal(),
            resume_signal: default_resume_signal(),
            pending_start_capacity: 0,
            suspend_warn_after: Duration::from_millis(1000),
        }
    }
}

impl ThreadsConfig {
    /// Reads the configuration from `GC_SUSPEND_SIGNAL`, `GC_RESUME_SIGNAL`,
    /// `GC_PENDING_START_CAPACITY` and `GC_SUSPEND_WARN_MS`, falling back to
    /// the defaults for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        #[cfg(unix)]
        {
            use crate::base::utils::read_signal_from_env;

            let (suspend, resume) = pick_signals(
                read_signal_from_env("GC_SUSPEND_SIGNAL"),
                read_signal_from_env("GC_RESUME_SIGNAL"),
            );
            config.suspend_signal = suspend;
            config.resume_signal = resume;
        }

        if let Some(capacity) = read_uint_from_env("GC_PENDING_START_CAPACITY") {
            config.pending_start_capacity = capacity;
        }

        config.suspend_warn_after = match read_uint_from_env("GC_SUSPEND_WARN_MS") {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => config.suspend_warn_after,
        };

        config
    }
}

/// Resolves the requested suspend/resume signals. A signal left unset takes
/// its default, or the other default when that would collide with the one
/// that was set.
#[cfg(unix)]
fn pick_signals(suspend: Option<i32>, resume: Option<i32>) -> (i32, i32) {
    let (default_suspend, default_resume) = (default_suspend_signal(), default_resume_signal());
    match (suspend, resume) {
        (None, None) => (default_suspend, default_resume),
        (Some(suspend), None) if suspend == default_resume => (suspend, default_suspend),
        (Some(suspend), None) => (suspend, default_resume),
        (None, Some(resume)) if resume == default_suspend => (default_resume, resume),
        (None, Some(resume)) => (default_suspend, resume),
        (Some(suspend), Some(resume)) if suspend != resume => (suspend, resume),
        (Some(signal), Some(_)) => {
            log::warn!(
                target: "gc-threads",
                "suspend and resume signals are both {}, using defaults",
                signal
            );
            (default_suspend, default_resume)
        }
    }
}

impl fmt::Display for ThreadsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadsConfig")
            .field("suspend_signal", &self.suspend_signal)
            .field("resume_signal", &self.resume_signal)
            .field("pending_start_capacity", &self.pending_start_capacity)
            .field(
                "suspend_warn_after_ms",
                &self.suspend_warn_after.as_millis(),
            )
            .finish()
    }
}

#[cfg(unix)]
const fn default_suspend_signal() -> i32 {
    libc::SIGUSR1
}

#[cfg(unix)]
const fn default_resume_signal() -> i32 {
    libc::SIGUSR2
}

#[cfg(not(unix))]
const fn default_suspend_signal() -> i32 {
    0
}

#[cfg(not(unix))]
const fn default_resume_signal() -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_distinct_signals() {
        let config = ThreadsConfig::default();
        #[cfg(unix)]
        assert_ne!(config.suspend_signal, config.resume_signal);
        assert_eq!(config.pending_start_capacity, 0);
        assert_eq!(config.suspend_warn_after, Duration::from_millis(1000));
    }

    #[cfg(unix)]
    #[test]
    fn one_sided_signal_choice_avoids_the_other_default() {
        let (usr1, usr2) = (libc::SIGUSR1, libc::SIGUSR2);
        assert_eq!(pick_signals(None, None), (usr1, usr2));
        assert_eq!(pick_signals(Some(usr2), None), (usr2, usr1));
        assert_eq!(pick_signals(None, Some(usr1)), (usr2, usr1));
        assert_eq!(pick_signals(Some(libc::SIGXCPU), None), (libc::SIGXCPU, usr2));
        assert_eq!(pick_signals(None, Some(libc::SIGXCPU)), (usr1, libc::SIGXCPU));
        assert_eq!(pick_signals(Some(usr2), Some(usr2)), (usr1, usr2));
    }

    #[test]
    fn from_env_overrides_capacity_and_warning() {
        std::env::set_var("GC_PENDING_START_CAPACITY", "8");
        std::env::set_var("GC_SUSPEND_WARN_MS", "250");
        let config = ThreadsConfig::from_env();
        std::env::remove_var("GC_PENDING_START_CAPACITY");
        std::env::remove_var("GC_SUSPEND_WARN_MS");

        assert_eq!(config.pending_start_capacity, 8);
        assert_eq!(config.suspend_warn_after, Duration::from_millis(250));
    }
}
