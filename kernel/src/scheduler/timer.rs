//! Timer and alarm registry.
//!
//! Sleepers share one node per target tick, kept in ascending order.
//! Alarms are periodic and per process: a due alarm whose process is
//! still inside a signal handler goes overdue and is retried on the next
//! tick instead of being dropped.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::process::{Process, ProcessId, Signal};
use crate::scheduler::Kernel;
use crate::sync::WaitQueue;

/// Processes sleeping until the same tick.
pub struct TimerNode {
    pub target: u64,
    pub waiting: WaitQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    /// Waiting for its target tick.
    Pending,
    /// Target reached, not yet decided.
    Due,
    /// Due while the process was in a handler.
    Overdue,
    /// SIGALRM posted for the current period.
    Delivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    Wait,
    Deliver,
    Defer,
}

pub struct Alarm {
    process: Weak<Process>,
    pid: ProcessId,
    target: u64,
    interval: u64,
    state: AlarmState,
}

impl Alarm {
    pub fn new(process: &Arc<Process>, target: u64, interval: u64) -> Self {
        Self::for_pid(Arc::downgrade(process), process.id(), target, interval)
    }

    fn for_pid(process: Weak<Process>, pid: ProcessId, target: u64, interval: u64) -> Self {
        Alarm {
            process,
            pid,
            target,
            interval,
            state: AlarmState::Pending,
        }
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Advance the state machine at tick `now`. `busy` is whether the
    /// owner is running a signal handler.
    pub fn poll(&mut self, now: u64, busy: bool) -> AlarmAction {
        if self.target > now {
            return AlarmAction::Wait;
        }
        self.state = AlarmState::Due;
        if busy {
            self.state = AlarmState::Overdue;
            AlarmAction::Defer
        } else {
            self.state = AlarmState::Delivered;
            AlarmAction::Deliver
        }
    }

    /// Start the next period. Targets advance by whole intervals so a
    /// late delivery does not shift later ones.
    pub fn rearm(&mut self) {
        self.target += self.interval;
        self.state = AlarmState::Pending;
    }
}

pub struct TimerRegistry {
    sleepers: VecDeque<Arc<TimerNode>>,
    alarms: VecDeque<Alarm>,
    deferred: u64,
}

impl TimerRegistry {
    pub const fn new() -> Self {
        TimerRegistry {
            sleepers: VecDeque::new(),
            alarms: VecDeque::new(),
            deferred: 0,
        }
    }

    /// Node for `target`, inserted in order if no sleeper uses it yet.
    pub fn sleeper_node(&mut self, target: u64) -> Arc<TimerNode> {
        let pos = self.sleepers.partition_point(|n| n.target < target);
        if let Some(node) = self.sleepers.get(pos) {
            if node.target == target {
                return node.clone();
            }
        }
        let node = Arc::new(TimerNode {
            target,
            waiting: WaitQueue::new(),
        });
        self.sleepers.insert(pos, node.clone());
        node
    }

    /// Remove and return every node whose target is at or before `now`.
    pub fn expire(&mut self, now: u64) -> Vec<Arc<TimerNode>> {
        let n = self.sleepers.partition_point(|n| n.target <= now);
        self.sleepers.drain(..n).collect()
    }

    pub fn sleeper_targets(&self) -> Vec<u64> {
        self.sleepers.iter().map(|n| n.target).collect()
    }

    fn insert_alarm(&mut self, alarm: Alarm) {
        let pos = self.alarms.partition_point(|a| a.target <= alarm.target);
        self.alarms.insert(pos, alarm);
    }

    /// Install `alarm`, replacing any alarm of the same process.
    pub fn arm_alarm(&mut self, alarm: Alarm) {
        self.cancel_alarm(alarm.pid);
        self.insert_alarm(alarm);
    }

    pub fn cancel_alarm(&mut self, pid: ProcessId) -> bool {
        let before = self.alarms.len();
        self.alarms.retain(|a| a.pid != pid);
        self.alarms.len() != before
    }

    pub fn alarm_of(&self, pid: ProcessId) -> Option<(u64, AlarmState)> {
        self.alarms.iter().find(|a| a.pid == pid).map(|a| (a.target, a.state))
    }

    /// Poll every due alarm once. Returns the processes that get SIGALRM.
    pub fn poll_alarms(&mut self, now: u64, busy: impl Fn(&Process) -> bool) -> Vec<Arc<Process>> {
        let n = self.alarms.partition_point(|a| a.target <= now);
        let due: Vec<Alarm> = self.alarms.drain(..n).collect();
        let mut fire = Vec::new();
        for mut alarm in due {
            let Some(process) = alarm.process.upgrade() else {
                continue;
            };
            match alarm.poll(now, busy(&process)) {
                AlarmAction::Deliver => {
                    alarm.rearm();
                    fire.push(process);
                }
                AlarmAction::Defer => self.deferred += 1,
                AlarmAction::Wait => {}
            }
            self.insert_alarm(alarm);
        }
        fire
    }

    pub fn deferred(&self) -> u64 {
        self.deferred
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Timer interrupts since boot.
    pub fn jiffies(&self) -> u64 {
        self.jiffies.load(Ordering::Acquire)
    }

    /// Whole seconds since boot.
    pub fn seconds(&self) -> u64 {
        self.jiffies() / self.config().timer_hz as u64
    }

    /// Block until the clock reaches `second`.
    pub fn sleep_until(&self, second: u64) {
        let target = second * self.config().timer_hz as u64;
        self.disable();
        if target > self.jiffies() {
            let node = self.timers.lock().sleeper_node(target);
            self.block(&node.waiting);
        }
        self.enable();
    }

    pub fn sleep_for(&self, seconds: u64) {
        self.sleep_until(self.seconds() + seconds);
    }

    /// Deliver SIGALRM to the current process every `seconds`, replacing
    /// any earlier alarm. `alarm(0)` posts SIGALRM once, right away.
    pub fn alarm(&self, seconds: u32) {
        let Some(me) = self.current() else { return };
        let interval = seconds as u64 * self.config().timer_hz as u64;
        self.disable();
        let mut timers = self.timers.lock();
        timers.cancel_alarm(me.id());
        if interval == 0 {
            drop(timers);
            self.signal(&me, Signal::Alrm);
        } else {
            timers.arm_alarm(Alarm::new(&me, self.jiffies() + interval, interval));
            drop(timers);
        }
        self.enable();
    }

    /// Per-tick timer work: wake sleepers and run due alarms.
    pub fn tick(&self) {
        let now = self.jiffies();
        if self.me().is_some_and(Process::is_idle) {
            self.idle_jiffies.fetch_add(1, Ordering::Relaxed);
        }
        let expired = self.timers.lock().expire(now);
        for node in expired {
            while let Some(sleeper) = node.waiting.pop() {
                self.make_ready(sleeper);
            }
        }
        let fire = self.timers.lock().poll_alarms(now, Process::in_signal);
        for process in fire {
            self.signal(&process, Signal::Alrm);
        }
    }

    /// The timer interrupt: account the tick, then preempt.
    pub fn timer_interrupt(&self) {
        self.start_irq();
        self.jiffies.fetch_add(1, Ordering::AcqRel);
        self.tick();
        self.end_irq();
        self.yield_now();
    }
}
