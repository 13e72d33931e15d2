//! Scripted stand-in for the SGE tools
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::sge::client::{CommandOutput, Scheduler};
use crate::sge::job::JobId;

#[derive(Default)]
struct FakeState {
    submit: Option<CommandOutput>,
    scripts: Vec<String>,
    listings: VecDeque<CommandOutput>,
    last_listing: Option<CommandOutput>,
    status_calls: usize,
    accounting: Option<CommandOutput>,
    deleted: Vec<JobId>,
}

/// Clones share state, so a test can keep one and hand another to a monitor
#[derive(Clone, Default)]
pub struct FakeScheduler {
    state: Rc<RefCell<FakeState>>,
}

pub const HEADER: &str = "job-ID  prior   name       user         state submit/start at     queue      slots ja-task-ID\n\
                          ---------------------------------------------------------------------------------------\n";

/// qstat output listing the given jobs
pub fn listing(rows: &[(u64, &str)]) -> String {
    let mut text = HEADER.to_string();
    for (id, code) in rows {
        text.push_str(&format!("{id} 0.50203 noop       kellys04     {code}     06/08/2017 14:48:57 all.q@cn-0046  1\n"));
    }
    text
}

impl FakeScheduler {
    pub fn on_submit(&self, output: CommandOutput) {
        self.state.borrow_mut().submit = Some(output);
    }

    /// Queue successive qstat results; the last one repeats
    pub fn listings(&self, outputs: Vec<CommandOutput>) {
        self.state.borrow_mut().listings.extend(outputs);
    }

    pub fn on_accounting(&self, output: CommandOutput) {
        self.state.borrow_mut().accounting = Some(output);
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state.borrow().scripts.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state.borrow().status_calls
    }

    pub fn deleted(&self) -> Vec<JobId> {
        self.state.borrow().deleted.clone()
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, script: &str) -> io::Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state.scripts.push(script.to_string());
        Ok(state.submit.clone().unwrap_or_default())
    }

    fn status(&self) -> io::Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state.status_calls += 1;
        if let Some(next) = state.listings.pop_front() {
            state.last_listing = Some(next);
        }
        Ok(state.last_listing.clone().unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn accounting(&self, _id: JobId) -> io::Result<CommandOutput> {
        Ok(self.state.borrow().accounting.clone().unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn delete(&self, ids: &[JobId]) -> io::Result<CommandOutput> {
        self.state.borrow_mut().deleted.extend_from_slice(ids);
        Ok(CommandOutput::ok("deleted"))
    }
}
