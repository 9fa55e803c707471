use crate::classify::{classify, ErrorCategory};
use crate::command::{CommandOutput, CommandTimeout, GitExecutor};
use crate::error::CommandError;
use std::collections::VecDeque;
use std::sync::Mutex;

type Reply = Result<CommandOutput, CommandError>;

struct Rule {
    prefix: Vec<String>,
    queued: VecDeque<Reply>,
    sticky: Option<Reply>,
}

#[derive(Default)]
pub(crate) struct ScriptedGit {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

pub(crate) fn ok(stdout: &str) -> Reply {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub(crate) fn failure(args: &str, stderr: &str) -> CommandError {
    CommandError::Failed {
        command: format!("git {args}"),
        code: Some(1),
        stderr: stderr.to_string(),
        category: classify("", stderr),
    }
}

pub(crate) fn network_failure() -> CommandError {
    let err = failure("fetch --all --prune", "fatal: unable to access 'https://example.invalid/': Could not resolve host: example.invalid");
    debug_assert!(matches!(err, CommandError::Failed { category: ErrorCategory::Network, .. }));
    err
}

pub(crate) const DIRTY_CHECKOUT: &str = "error: The following untracked working tree files would be overwritten by checkout:\n\tnotes.txt\nPlease move or remove them before you switch branches.";

pub(crate) const MERGE_CONFLICT: &str = "CONFLICT (content): Merge conflict in src/lib.rs\nAutomatic merge failed; fix conflicts and then commit the result.";

impl ScriptedGit {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn rule(&self, prefix: &[&str]) -> usize {
        let mut rules = self.rules.lock().expect("rules");
        let prefix: Vec<String> = prefix.iter().map(|part| part.to_string()).collect();
        if let Some(position) = rules.iter().position(|rule| rule.prefix == prefix) {
            return position;
        }
        rules.push(Rule {
            prefix,
            queued: VecDeque::new(),
            sticky: None,
        });
        rules.len() - 1
    }

    /// Every matching call gets `reply` once the queue is drained.
    pub(crate) fn always(&self, prefix: &[&str], reply: Reply) -> &Self {
        let position = self.rule(prefix);
        self.rules.lock().expect("rules")[position].sticky = Some(reply);
        self
    }

    /// The next matching call gets `reply`.
    pub(crate) fn once(&self, prefix: &[&str], reply: Reply) -> &Self {
        let position = self.rule(prefix);
        self.rules.lock().expect("rules")[position]
            .queued
            .push_back(reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn count(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }
}

impl GitExecutor for ScriptedGit {
    async fn exec(&self, args: Vec<String>, _timeout: CommandTimeout) -> Result<CommandOutput, CommandError> {
        self.calls.lock().expect("calls").push(args.clone());
        let mut rules = self.rules.lock().expect("rules");
        for rule in rules.iter_mut() {
            if args.len() < rule.prefix.len() || args[..rule.prefix.len()] != rule.prefix[..] {
                continue;
            }
            if let Some(reply) = rule.queued.pop_front() {
                return reply;
            }
            if let Some(reply) = &rule.sticky {
                return reply.clone();
            }
        }
        ok("")
    }
}
