// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Line editor frontend with first-word command completion.

use std::sync::Arc;

use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Config, Context, Editor};
use rustyline::{Helper, Highlighter, Hinter, Validator};

use faas_controller::FaasController;

use crate::executor::{COMMANDS, Executor};

#[derive(Helper, Highlighter, Hinter, Validator)]
struct CmdHelper;

impl Completer for CmdHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let head = &line[..pos];
        if head.contains(' ') {
            return Ok((pos, Vec::new()));
        }
        let candidates = COMMANDS
            .iter()
            .filter(|cmd| cmd.starts_with(head))
            .map(|cmd| Pair {
                display: cmd.to_string(),
                replacement: cmd.to_string(),
            })
            .collect();
        Ok((0, candidates))
    }
}

fn editor() -> rustyline::Result<Editor<CmdHelper, DefaultHistory>> {
    let config = Config::builder()
        .completion_type(CompletionType::List)
        .build();
    let mut editor = Editor::with_config(config)?;
    editor.set_helper(Some(CmdHelper));
    Ok(editor)
}

/// Blocking read-eval loop; returns when the operator quits. Call from a
/// blocking-capable thread and hand in the runtime handle.
pub fn run(controller: Arc<FaasController>, rt: tokio::runtime::Handle) {
    let executor = Executor::new(controller, rt);
    let mut editor = match editor() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to start the shell: {e}");
            return;
        }
    };

    loop {
        match editor.readline(">>> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if !executor.execute(&line) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = executor.execute("quit");
                break;
            }
            Err(e) => {
                eprintln!("input error: {e}");
                break;
            }
        }
    }
}
