/// A single retransmit slot. The payload is sent whenever the slot is
/// *active* (tick countdown at zero), and every send burns one retry.
#[derive(Debug)]
pub(crate) struct Task<T> {
    obj: T,
    max_ticks: i32,
    max_retries: i32,
    ticks: i32,
    retries: i32,
}

impl<T> Task<T> {
    pub(crate) fn new(obj: T, ticks: i32, retries: i32) -> Self {
        let mut task = Self {
            obj,
            max_ticks: ticks,
            max_retries: retries,
            ticks: 0,
            retries: 0,
        };
        task.reset();
        task
    }

    pub(crate) fn obj(&self) -> &T {
        &self.obj
    }

    /// Dead tasks stay dead until `reset`.
    pub(crate) fn alive(&self) -> bool {
        self.retries >= 0
    }

    /// Ready to send on this tick.
    pub(crate) fn active(&self) -> bool {
        self.alive() && self.ticks == 0
    }

    pub(crate) fn reset(&mut self) {
        self.ticks = 0;
        self.retries = self.max_retries;
    }

    pub(crate) fn stop(&mut self) {
        self.retries = -1;
    }

    pub(crate) fn tick(&mut self) {
        self.ticks -= 1;
        if self.ticks == -1 {
            self.ticks += self.max_ticks;
            self.retries -= 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_task_fires_every_period() {
        let mut task = Task::new((), 4, 2);
        let mut fired = Vec::new();
        for round in 0..12 {
            if task.active() {
                fired.push(round);
            }
            task.tick();
        }
        // period of 4 ticks, retries exhausted after the third send
        assert_eq!(fired, vec![0, 4, 8]);
        assert!(!task.alive());
    }

    #[test]
    fn test_stop_and_reset() {
        let mut task = Task::new((), 4, 2);
        task.stop();
        assert!(!task.alive());
        assert!(!task.active());
        task.reset();
        assert!(task.active());
    }

    #[test]
    fn test_zero_retries_sends_once() {
        let mut task = Task::new((), 4, 0);
        assert!(task.active());
        task.tick();
        for _ in 0..8 {
            assert!(!task.active());
            task.tick();
        }
    }
}
