use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use crate::process::{CmdOutput, CommandRunner};

type Handler = dyn Fn(&str, &[&str]) -> Option<CmdOutput> + Send + Sync;

/// Deterministic [`CommandRunner`] for tests.
///
/// Responses are scripted per program basename and popped in order; the last
/// scripted response is sticky so polling loops settle on a final state. A
/// fallback handler can compute responses (or perform side effects such as
/// creating the file a faked `truncate` would create). Unscripted programs
/// succeed with empty output.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, VecDeque<CmdOutput>>>,
    handler: Mutex<Option<Box<Handler>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `output` as the next response for `program`.
    pub fn script(&self, program: &str, output: CmdOutput) {
        self.scripts
            .lock()
            .expect("fake runner mutex poisoned")
            .entry(program.to_owned())
            .or_default()
            .push_back(output);
    }

    /// Install a fallback handler consulted before the scripted responses.
    pub fn on(
        &self,
        handler: impl Fn(&str, &[&str]) -> Option<CmdOutput> + Send + Sync + 'static,
    ) {
        *self.handler.lock().expect("fake runner mutex poisoned") =
            Some(Box::new(handler));
    }

    /// Every invocation so far, as `[program, arg...]` rows.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .expect("fake runner mutex poisoned")
            .clone()
    }

    pub fn calls_for(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|call| call.first().map(String::as_str) == Some(program))
            .collect()
    }

    fn respond(&self, program: &str, args: &[&str]) -> CmdOutput {
        let name = Path::new(program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_owned());

        let mut call = vec![name.clone()];
        call.extend(args.iter().map(|arg| (*arg).to_owned()));
        self.calls
            .lock()
            .expect("fake runner mutex poisoned")
            .push(call);

        if let Some(handler) = &*self.handler.lock().expect("fake runner mutex poisoned")
        {
            if let Some(output) = handler(&name, args) {
                return output;
            }
        }

        let mut scripts = self.scripts.lock().expect("fake runner mutex poisoned");
        if let Some(queue) = scripts.get_mut(&name) {
            if queue.len() > 1 {
                if let Some(output) = queue.pop_front() {
                    return output;
                }
            }
            if let Some(last) = queue.front() {
                return last.clone();
            }
        }

        CmdOutput::ok("")
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> CmdOutput {
        self.respond(program, args)
    }

    fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Duration,
    ) -> CmdOutput {
        self.respond(program, args)
    }
}
