//! Pending-event queue with cancellation.

use crate::{EntityRegistry, Event, EventId, NotificationRecord, SimContext, SimError, SimTime};
use std::collections::{BinaryHeap, HashSet};

/// Min-heap of pending events ordered by `(time, EventId)`.
///
/// Cancelled ids are remembered and the matching events are skipped when
/// they reach the head of the queue. Ids of events that already fired are
/// not remembered.
#[derive(Default)]
pub struct Scheduler {
    queue: BinaryHeap<Event>,
    queued: HashSet<EventId>,
    cancelled: HashSet<EventId>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event.
    pub fn schedule(&mut self, event: Event) {
        self.queued.insert(event.id);
        self.queue.push(event);
    }

    /// Mark an event as cancelled. No effect once it has fired.
    pub fn cancel(&mut self, id: EventId) {
        if self.queued.contains(&id) {
            self.cancelled.insert(id);
        }
    }

    /// Move pending events and cancellations out of the context.
    pub fn absorb(&mut self, ctx: &mut SimContext) {
        for event in ctx.take_pending_events() {
            self.schedule(event);
        }
        for id in ctx.take_cancelled() {
            self.cancel(id);
        }
    }

    /// Time of the next live event.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        self.skip_cancelled();
        self.queue.peek().map(|e| e.time)
    }

    /// Pop the next live event.
    pub fn pop_next(&mut self) -> Option<Event> {
        self.skip_cancelled();
        let event = self.queue.pop()?;
        self.queued.remove(&event.id);
        Some(event)
    }

    /// Number of cancellations still waiting for their event.
    pub fn cancelled_len(&self) -> usize {
        self.cancelled.len()
    }

    /// Number of queued events, cancelled ones included.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn skip_cancelled(&mut self) {
        while let Some(head) = self.queue.peek() {
            if self.cancelled.remove(&head.id) {
                let id = head.id;
                self.queue.pop();
                self.queued.remove(&id);
            } else {
                break;
            }
        }
    }
}

/// Run every event up to and including `end`, handing each notification to
/// `observer`. Returns the number of dispatched events.
pub fn run_until<F>(
    registry: &mut EntityRegistry,
    scheduler: &mut Scheduler,
    ctx: &mut SimContext,
    end: SimTime,
    mut observer: F,
) -> Result<u64, SimError>
where
    F: FnMut(&NotificationRecord),
{
    scheduler.absorb(ctx);
    let mut dispatched = 0;
    while let Some(time) = scheduler.peek_time() {
        if time > end {
            break;
        }
        let Some(event) = scheduler.pop_next() else {
            break;
        };
        ctx.set_time(event.time);
        registry.dispatch_event(&event, ctx)?;
        scheduler.absorb(ctx);
        for record in ctx.take_notifications() {
            observer(&record);
        }
        dispatched += 1;
    }
    if ctx.time() < end {
        ctx.set_time(end);
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Entity, EntityId, EventPayload};

    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(u64, u64)>>>;

    struct Recorder {
        id: EntityId,
        seen: Seen,
    }

    impl Entity for Recorder {
        fn entity_id(&self) -> EntityId {
            self.id
        }

        fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
            if let EventPayload::Timer { timer_id } = event.payload {
                self.seen.lock().unwrap().push((ctx.time().as_millis(), timer_id));
                if timer_id == 1 {
                    // Same-time follow-up runs after everything already queued at this instant.
                    ctx.post_immediate(vec![self.id], EventPayload::Timer { timer_id: 99 });
                }
            }
            Ok(())
        }
    }

    fn setup() -> (EntityRegistry, Seen) {
        let seen = Seen::default();
        let mut registry = EntityRegistry::new();
        registry.register(Box::new(Recorder {
            id: EntityId(1),
            seen: seen.clone(),
        }));
        (registry, seen)
    }

    #[test]
    fn test_fifo_at_identical_time_and_cancellation() {
        let (mut registry, seen) = setup();
        let mut ctx = SimContext::new(0);
        let mut scheduler = Scheduler::new();

        ctx.post_event(SimTime::from_millis(10), vec![EntityId(1)], EventPayload::Timer { timer_id: 1 });
        ctx.post_event(SimTime::from_millis(10), vec![EntityId(1)], EventPayload::Timer { timer_id: 2 });
        let doomed = ctx.post_event(SimTime::from_millis(20), vec![EntityId(1)], EventPayload::Timer { timer_id: 3 });
        scheduler.absorb(&mut ctx);
        ctx.cancel_event(doomed);

        let n = run_until(&mut registry, &mut scheduler, &mut ctx, SimTime::from_secs(1.0), |_| {}).unwrap();
        assert_eq!(n, 3);
        assert_eq!(*seen.lock().unwrap(), vec![(10, 1), (10, 2), (10, 99)]);
        assert_eq!(ctx.time(), SimTime::from_secs(1.0));
    }

    #[test]
    fn test_run_until_leaves_later_events_queued() {
        let (mut registry, seen) = setup();
        let mut ctx = SimContext::new(0);
        let mut scheduler = Scheduler::new();

        ctx.post_event(SimTime::from_millis(5), vec![EntityId(1)], EventPayload::Timer { timer_id: 7 });
        ctx.post_event(SimTime::from_millis(50), vec![EntityId(1)], EventPayload::Timer { timer_id: 8 });
        run_until(&mut registry, &mut scheduler, &mut ctx, SimTime::from_millis(5), |_| {}).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(5, 7)]);
        assert_eq!(scheduler.peek_time(), Some(SimTime::from_millis(50)));
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let (mut registry, _) = setup();
        let mut ctx = SimContext::new(0);
        let mut scheduler = Scheduler::new();
        ctx.post_immediate(vec![EntityId(42)], EventPayload::SimulationEnd);
        let result = run_until(&mut registry, &mut scheduler, &mut ctx, SimTime::from_secs(1.0), |_| {});
        assert!(matches!(result, Err(SimError::EntityNotFound(EntityId(42)))));
    }

    #[test]
    fn test_cancelling_a_fired_event_is_forgotten() {
        let (mut registry, seen) = setup();
        let mut ctx = SimContext::new(0);
        let mut scheduler = Scheduler::new();

        let fired = ctx.post_event(SimTime::from_millis(5), vec![EntityId(1)], EventPayload::Timer { timer_id: 7 });
        let pending = ctx.post_event(SimTime::from_millis(50), vec![EntityId(1)], EventPayload::Timer { timer_id: 8 });
        run_until(&mut registry, &mut scheduler, &mut ctx, SimTime::from_millis(10), |_| {}).unwrap();

        scheduler.cancel(fired);
        assert_eq!(scheduler.cancelled_len(), 0);
        scheduler.cancel(pending);
        assert_eq!(scheduler.cancelled_len(), 1);

        run_until(&mut registry, &mut scheduler, &mut ctx, SimTime::from_secs(1.0), |_| {}).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(5, 7)]);
        assert_eq!(scheduler.cancelled_len(), 0);
        assert!(scheduler.is_empty());
    }
}
