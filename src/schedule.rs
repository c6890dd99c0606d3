// Time-tagged motion schedule: text parser and looping scheduler
//
// Times are seconds. Schedule times are relative to the start of a cycle;
// the scheduler shifts copies of the base schedule onto the worker clock.

use std::collections::VecDeque;
use tracing::{debug, info};

use crate::messages::MoveParams;

/// Used when no schedule file is present
pub const SAMPLE_SCHEDULE: &str = "\
# time, kind, degrees, velocity, acceleration, dwell
0.0, MOVE, +2.0, 10, 100, 0
5.0, MOVE, -2.0, 10, 100, 0
";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Move(MoveParams),
    Home,
    EStop,
    /// Re-anchor the whole schedule at the current instant
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Command {
    pub time: f64,
    pub action: Action,
}

impl Command {
    /// Copy with the time moved by `delta`
    pub fn shifted(&self, delta: f64) -> Self {
        Self {
            time: self.time + delta,
            action: self.action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Schedule line {line}: {reason}")]
pub struct ScheduleError {
    /// 1-based
    pub line: usize,
    pub reason: String,
}

/// Parse schedule text: `time, kind[, degrees, velocity, acceleration, dwell]`
///
/// `#` starts a comment. A missing kind means MOVE; RESET is accepted for
/// RESTART. The result is sorted by time.
pub fn parse_schedule(text: &str) -> Result<Vec<Command>, ScheduleError> {
    let mut commands = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        let content = raw.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let err = |reason: String| ScheduleError { line, reason };
        let parts: Vec<&str> = content.split(',').map(str::trim).collect();

        let time: f64 = parts[0]
            .parse()
            .map_err(|_| err(format!("invalid time '{}'", parts[0])))?;
        if !time.is_finite() || time < 0.0 {
            return Err(err(format!("time must be a non-negative number, got {}", time)));
        }

        let kind = parts.get(1).map(|k| k.to_ascii_uppercase()).unwrap_or_else(|| "MOVE".into());
        let action = match kind.as_str() {
            "RESTART" | "RESET" => Action::Restart,
            "HOME" => Action::Home,
            "ESTOP" => Action::EStop,
            "MOVE" => {
                if parts.len() != 6 {
                    return Err(err(format!(
                        "MOVE needs time, kind, degrees, velocity, acceleration, dwell ({} fields given)",
                        parts.len()
                    )));
                }
                let target_deg: f64 = parts[2]
                    .parse()
                    .map_err(|_| err(format!("invalid angle '{}'", parts[2])))?;
                if !target_deg.is_finite() {
                    return Err(err(format!("invalid angle '{}'", parts[2])));
                }
                let field = |i: usize, name: &str| {
                    parts[i]
                        .parse::<u16>()
                        .map_err(|_| err(format!("invalid {} '{}'", name, parts[i])))
                };
                Action::Move(MoveParams {
                    target_deg,
                    velocity: field(3, "velocity")?,
                    acceleration: field(4, "acceleration")?,
                    dwell: field(5, "dwell")?,
                })
            }
            other => return Err(err(format!("unknown command '{}'", other))),
        };
        commands.push(Command { time, action });
    }

    commands.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(commands)
}

/// Loops a base schedule against a monotonic clock
///
/// Cycle `n` runs the base schedule shifted by `origin + n * cycle_period`.
/// A cycle period of zero or less runs the schedule once and stops looping.
#[derive(Debug, Clone)]
pub struct Scheduler {
    base: Vec<Command>,
    cycle_period: f64,
    queue: VecDeque<Command>,
    looping: bool,
    cycle_index: u64,
    origin: f64,
}

impl Scheduler {
    /// Cycle period is the time of the last command
    pub fn new(base: Vec<Command>) -> Self {
        let cycle_period = base.last().map(|c| c.time).unwrap_or(0.0);
        Self::with_cycle_period(base, cycle_period)
    }

    pub fn with_cycle_period(mut base: Vec<Command>, cycle_period: f64) -> Self {
        base.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            base,
            cycle_period,
            queue: VecDeque::new(),
            looping: false,
            cycle_index: 0,
            origin: 0.0,
        }
    }

    pub fn cycle_period(&self) -> f64 {
        self.cycle_period
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    pub fn is_looping(&self) -> bool {
        self.looping
    }

    /// Commands of the current cycle not yet dispatched
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn start_loop(&mut self, now: f64) {
        if self.base.is_empty() {
            info!("Schedule is empty, loop not started");
            return;
        }
        self.origin = now;
        self.cycle_index = 0;
        self.looping = true;
        self.load_cycle();
        info!(
            "Loop started: {} commands, cycle period {:.2}s",
            self.queue.len(),
            self.cycle_period
        );
    }

    pub fn stop_loop(&mut self) {
        if self.looping {
            info!("Loop stopped at cycle {}", self.cycle_index);
        }
        self.queue.clear();
        self.cycle_index = 0;
        self.looping = false;
    }

    /// Pop every command due at `now`; RESTART is handled here and not returned
    ///
    /// At most one new cycle is loaded per call. A RESTART ends the call.
    pub fn poll(&mut self, now: f64) -> Vec<Command> {
        let mut due = Vec::new();
        if !self.looping {
            return due;
        }

        let mut reloaded = false;
        loop {
            match self.queue.front() {
                Some(cmd) if cmd.time <= now => {
                    let Some(cmd) = self.queue.pop_front() else {
                        break;
                    };
                    if cmd.action == Action::Restart {
                        info!("RESTART at {:.2}s, schedule re-anchored", now);
                        self.origin = now;
                        self.cycle_index = 0;
                        self.load_cycle();
                        break;
                    }
                    due.push(cmd);
                }
                Some(_) => break,
                None => {
                    if reloaded {
                        break;
                    }
                    if self.cycle_period <= 0.0 {
                        info!("Schedule finished (no cycle period), loop stopped");
                        self.looping = false;
                        break;
                    }
                    self.cycle_index += 1;
                    self.load_cycle();
                    reloaded = true;
                }
            }
        }
        due
    }

    fn load_cycle(&mut self) {
        let shift = self.origin + self.cycle_index as f64 * self.cycle_period;
        self.queue = self.base.iter().map(|c| c.shifted(shift)).collect();
        debug!("Cycle {} loaded, shift {:.3}s", self.cycle_index, shift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn move_deg(cmd: &Command) -> f64 {
        match cmd.action {
            Action::Move(p) => p.target_deg,
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sorts_and_skips_comments() {
        let text = "# header\n5.0, MOVE, -2.0, 10, 100, 0  # back\n\n0.0,move,+2.0,10,100,0\n7.5,RESET\n";
        let cmds = parse_schedule(text).unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].time, 0.0);
        assert_eq!(move_deg(&cmds[0]), 2.0);
        assert_eq!(cmds[1].time, 5.0);
        assert_eq!(cmds[2].action, Action::Restart);
    }

    #[test]
    fn test_parse_home_estop_and_bare_time() {
        assert!(parse_schedule("1.0").is_err());
        let cmds = parse_schedule("1.0, HOME\n2.0, ESTOP").unwrap();
        assert_eq!(cmds[0].action, Action::Home);
        assert_eq!(cmds[1].action, Action::EStop);
    }

    #[test]
    fn test_parse_errors_carry_line_number() {
        let err = parse_schedule("0.0,MOVE,1,10,100,0\n1.0,JUMP\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.reason.contains("JUMP"));

        let err = parse_schedule("0.0,MOVE,1,10,100").unwrap_err();
        assert_eq!(err.line, 1);

        let err = parse_schedule("\n\nabc,MOVE,1,10,100,0").unwrap_err();
        assert_eq!(err.line, 3);

        let err = parse_schedule("0.0,MOVE,1,70000,100,0").unwrap_err();
        assert!(err.reason.contains("velocity"));

        assert!(parse_schedule("-1.0,RESTART").is_err());
    }

    #[test]
    fn test_sample_schedule_parses() {
        let cmds = parse_schedule(SAMPLE_SCHEDULE).unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(Scheduler::new(cmds).cycle_period(), 5.0);
    }

    #[test]
    fn test_two_move_loop_scenario() {
        let cmds = parse_schedule("0.0,MOVE,+2.0,10,100,0\n5.0,MOVE,-2.0,10,100,0").unwrap();
        let mut sched = Scheduler::with_cycle_period(cmds, 5.0);
        sched.start_loop(0.0);

        let fired = sched.poll(0.01);
        assert_eq!(fired.iter().map(move_deg).collect::<Vec<_>>(), vec![2.0]);

        assert!(sched.poll(2.0).is_empty());

        let fired = sched.poll(5.01);
        assert_eq!(fired.iter().map(move_deg).collect::<Vec<_>>(), vec![-2.0, 2.0]);
        assert_eq!(fired[1].time, 5.0);
        assert_eq!(sched.cycle_index(), 1);

        let fired = sched.poll(10.01);
        assert_eq!(fired.iter().map(move_deg).collect::<Vec<_>>(), vec![-2.0, 2.0]);
        assert_eq!(fired[1].time, 10.0);
        assert_eq!(sched.cycle_index(), 2);
    }

    #[test]
    fn test_start_loop_shifts_to_now() {
        let cmds = parse_schedule("0.0,MOVE,1,10,100,0\n3.0,MOVE,2,10,100,0").unwrap();
        let mut sched = Scheduler::new(cmds);
        assert!(sched.poll(100.0).is_empty());

        sched.start_loop(100.0);
        assert_eq!(sched.poll(100.0).len(), 1);
        assert!(sched.poll(102.9).is_empty());
        assert_eq!(sched.poll(103.0)[0].time, 103.0);
    }

    #[test]
    fn test_restart_reanchors_schedule() {
        let cmds = parse_schedule("0.0,MOVE,1,10,100,0\n2.0,RESTART\n3.0,MOVE,2,10,100,0").unwrap();
        let mut sched = Scheduler::new(cmds);
        sched.start_loop(0.0);
        assert_eq!(sched.poll(0.0).len(), 1);

        // RESTART is consumed, nothing else fires this poll
        assert!(sched.poll(2.5).is_empty());
        assert_eq!(sched.pending(), 3);
        assert_eq!(sched.cycle_index(), 0);

        let fired = sched.poll(2.5);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].time, 2.5);
        assert!(sched.is_looping());
    }

    #[test]
    fn test_stop_loop_clears_queue() {
        let mut sched = Scheduler::new(parse_schedule(SAMPLE_SCHEDULE).unwrap());
        sched.start_loop(0.0);
        sched.stop_loop();
        assert!(!sched.is_looping());
        assert_eq!(sched.pending(), 0);
        assert!(sched.poll(50.0).is_empty());
    }

    #[test]
    fn test_zero_period_runs_once() {
        let mut sched = Scheduler::new(parse_schedule("0.0, HOME").unwrap());
        sched.start_loop(1.0);
        assert_eq!(sched.poll(1.0).len(), 1);
        assert!(sched.poll(2.0).is_empty());
        assert!(!sched.is_looping());
    }

    proptest! {
        #[test]
        fn prop_cycle_n_is_base_shifted_by_n_periods(
            mut times in prop::collection::vec(0.0f64..10.0, 1..6),
            step in 0.05f64..2.0,
        ) {
            times.sort_by(|a, b| a.total_cmp(b));
            let last = *times.last().unwrap();
            prop_assume!(last > 0.5);

            let base: Vec<Command> = times
                .iter()
                .enumerate()
                .map(|(i, &t)| Command { time: t, action: Action::Move(MoveParams {
                    target_deg: i as f64, velocity: 1, acceleration: 1, dwell: 0,
                })})
                .collect();
            let mut sched = Scheduler::new(base.clone());
            sched.start_loop(0.0);

            let mut fired = Vec::new();
            let mut now = 0.0;
            while now < 4.0 * last {
                fired.extend(sched.poll(now));
                now += step;
            }

            prop_assert!(!fired.is_empty());
            for (k, cmd) in fired.iter().enumerate() {
                let n = (k / base.len()) as f64;
                let expected = base[k % base.len()].time + n * last;
                prop_assert!((cmd.time - expected).abs() < 1e-9);
                prop_assert_eq!(cmd.action, base[k % base.len()].action);
            }
        }
    }
}
