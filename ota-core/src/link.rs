//! Network association tracking.
//!
//! [`ReconnectScheduler`] turns the blocking "wait for association, then sleep
//! and retry" pattern into a poll-driven state machine: every association
//! attempt is given [`ASSOCIATION_TIMEOUT`] to succeed, after which the
//! scheduler backs off for [`RECONNECT_INTERVAL`] before trying again.

use core::{fmt, ops::Add, time::Duration};

/// Upper bound on a single association attempt.
pub const ASSOCIATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Pause between a failed association attempt and the next one.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Association state reported by the network collaborator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkStatus {
    Connected,
    Connecting,
    Disconnected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Connected => f.write_str("connected"),
            LinkStatus::Connecting => f.write_str("connecting"),
            LinkStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Network collaborator driven by the scheduler.
pub trait NetworkLink {
    fn status(&self) -> LinkStatus;

    /// Starts a new association attempt without blocking.
    fn reconnect(&mut self);
}

/// Transition observed by a single [`ReconnectScheduler::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// Link came up.
    Associated,
    /// Link went down after having been up.
    Lost,
    /// A new association attempt was started.
    Retrying { attempt: u32 },
    /// An attempt ran out of time.
    TimedOut,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Phase<TInstant> {
    Idle,
    Up,
    Associating { deadline: TInstant },
    Backoff { retry_at: TInstant },
}

/// Poll-driven reconnect loop with a bounded wait and fixed retry interval.
#[derive(Copy, Clone, Debug)]
pub struct ReconnectScheduler<TInstant> {
    phase: Phase<TInstant>,
    attempts: u32,
}

impl<TInstant> ReconnectScheduler<TInstant>
where
    TInstant: Copy + Ord + Add<Duration, Output = TInstant>,
{
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: Phase::Idle,
            attempts: 0,
        }
    }

    /// Returns `true` while the link is associated.
    #[must_use]
    pub fn is_up(&self) -> bool {
        matches!(self.phase, Phase::Up)
    }

    /// Association attempts started since the link was last up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Advances the state machine and reports at most one transition.
    pub fn poll<L>(&mut self, link: &mut L, now: TInstant) -> Option<LinkEvent>
    where
        L: NetworkLink + ?Sized,
    {
        if link.status() == LinkStatus::Connected {
            if self.is_up() {
                return None;
            }
            self.phase = Phase::Up;
            self.attempts = 0;
            return Some(LinkEvent::Associated);
        }

        match self.phase {
            Phase::Up => {
                self.start_attempt(link, now);
                Some(LinkEvent::Lost)
            }
            Phase::Idle => Some(self.start_attempt(link, now)),
            Phase::Associating { deadline } => {
                if now < deadline {
                    return None;
                }
                self.phase = Phase::Backoff {
                    retry_at: now + RECONNECT_INTERVAL,
                };
                Some(LinkEvent::TimedOut)
            }
            Phase::Backoff { retry_at } => {
                if now < retry_at {
                    return None;
                }
                Some(self.start_attempt(link, now))
            }
        }
    }

    fn start_attempt<L>(&mut self, link: &mut L, now: TInstant) -> LinkEvent
    where
        L: NetworkLink + ?Sized,
    {
        link.reconnect();
        self.attempts = self.attempts.saturating_add(1);
        self.phase = Phase::Associating {
            deadline: now + ASSOCIATION_TIMEOUT,
        };
        LinkEvent::Retrying {
            attempt: self.attempts,
        }
    }
}

impl<TInstant> Default for ReconnectScheduler<TInstant>
where
    TInstant: Copy + Ord + Add<Duration, Output = TInstant>,
{
    fn default() -> Self {
        Self::new()
    }
}
