//! Per-invocation resumption state shared by the trampoline and the
//! suspension points of one computation.

use parking_lot::Mutex;

use crate::value::ResumeValue;

/// Lifecycle of a suspended computation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    #[default]
    Created,
    /// Being polled by the trampoline.
    Running,
    /// Parked at a suspension point, waiting for a completion.
    Suspended,
    Finished,
}

/// What happened to an offered resumption value.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Accepted while the computation is running; the trampoline loop picks it up.
    Queued,
    /// Accepted and the caller now owns the drive loop.
    Claimed,
    /// Dropped: nothing is waiting for it.
    Discarded(&'static str),
}

/// Result of parking after a `Pending` poll.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Park {
    /// A value arrived during the poll; poll again.
    Repoll,
    Suspended,
}

#[derive(Debug, Default)]
struct State {
    phase: Phase,
    /// A suspension point is waiting for a value.
    armed: bool,
    inbox: Option<ResumeValue>,
    /// Values handed to suspension points so far.
    delivered: u64,
    /// Bumped each time a suspension point arms.
    generation: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    state: Mutex<State>,
}

impl Mailbox {
    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// The invoking caller takes the drive loop for the first run.
    pub(crate) fn begin(&self) {
        self.state.lock().phase = Phase::Running;
    }

    /// Arm a new suspension point and return its generation.
    pub(crate) fn arm(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.armed = true;
        state.inbox = None;
        state.generation
    }

    /// Stop waiting; any value that already arrived is dropped.
    pub(crate) fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.inbox = None;
    }

    pub(crate) fn take(&self) -> Option<ResumeValue> {
        let mut state = self.state.lock();
        let value = state.inbox.take();
        if value.is_some() {
            state.delivered += 1;
        }
        value
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    /// Offer a completion's value to the waiting suspension point.
    ///
    /// A value tagged with `generation` is only accepted by the suspension
    /// point armed with that generation.
    pub(crate) fn offer(&self, value: ResumeValue, generation: Option<u64>) -> Delivery {
        let mut state = self.state.lock();
        if state.phase == Phase::Finished {
            return Delivery::Discarded("computation already finished");
        }
        if generation.is_some_and(|g| g != state.generation) {
            return Delivery::Discarded("stale suspension point");
        }
        if !state.armed || state.inbox.is_some() {
            return Delivery::Discarded("no suspension point waiting");
        }
        state.armed = false;
        state.inbox = Some(value);
        match state.phase {
            Phase::Running => Delivery::Queued,
            _ => {
                state.phase = Phase::Running;
                Delivery::Claimed
            }
        }
    }

    /// Called by the drive loop after a `Pending` poll.
    ///
    /// `stalled` means the previous repoll did not consume the waiting value.
    pub(crate) fn park(&self, stalled: bool) -> Park {
        let mut state = self.state.lock();
        if state.inbox.is_some() {
            if !stalled {
                return Park::Repoll;
            }
            tracing::warn!("Resumption value was not consumed by the computation, dropping it");
            state.inbox = None;
        }
        if !state.armed {
            tracing::warn!("Computation parked without a suspension point waiting; it cannot be resumed");
        }
        state.phase = Phase::Suspended;
        Park::Suspended
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Finished;
        state.armed = false;
        state.inbox = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_without_waiter_is_discarded() {
        let mailbox = Mailbox::default();
        mailbox.begin();

        assert!(matches!(
            mailbox.offer(ResumeValue::Empty, None),
            Delivery::Discarded(_)
        ));
    }

    #[test]
    fn test_offer_while_running_is_queued() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        mailbox.arm();

        assert_eq!(mailbox.offer(ResumeValue::Empty, None), Delivery::Queued);
        assert_eq!(mailbox.park(false), Park::Repoll);
        assert_eq!(mailbox.take(), Some(ResumeValue::Empty));
        assert_eq!(mailbox.delivered(), 1);
    }

    #[test]
    fn test_offer_while_suspended_claims() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        mailbox.arm();
        assert_eq!(mailbox.park(false), Park::Suspended);

        assert_eq!(mailbox.offer(ResumeValue::Empty, None), Delivery::Claimed);
        assert_eq!(mailbox.phase(), Phase::Running);
    }

    #[test]
    fn test_second_offer_is_discarded() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        mailbox.arm();

        assert_eq!(mailbox.offer(ResumeValue::Empty, None), Delivery::Queued);
        assert!(matches!(
            mailbox.offer(ResumeValue::Empty, None),
            Delivery::Discarded(_)
        ));
    }

    #[test]
    fn test_offer_after_close_is_discarded() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        mailbox.arm();
        mailbox.close();

        assert_eq!(
            mailbox.offer(ResumeValue::Empty, None),
            Delivery::Discarded("computation already finished")
        );
    }

    #[test]
    fn test_stalled_park_drops_value() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        mailbox.arm();
        mailbox.offer(ResumeValue::Empty, None);

        assert_eq!(mailbox.park(true), Park::Suspended);
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_offer_from_earlier_generation_is_discarded() {
        let mailbox = Mailbox::default();
        mailbox.begin();
        let first = mailbox.arm();
        assert_eq!(mailbox.offer(ResumeValue::Empty, Some(first)), Delivery::Queued);
        assert_eq!(mailbox.take(), Some(ResumeValue::Empty));

        let second = mailbox.arm();
        assert_ne!(first, second);
        assert_eq!(
            mailbox.offer(ResumeValue::Empty, Some(first)),
            Delivery::Discarded("stale suspension point")
        );
        assert_eq!(mailbox.offer(ResumeValue::Empty, Some(second)), Delivery::Queued);
    }
}
