//! Interactive chat shell.
//!
//! By default we use `rustyline` for line editing and history. A minimal
//! stdin-based fallback exists behind `--no-default-features`.

use anyhow::Result;
use colored::Colorize;
use tabletalk_agent::{Agent, ConversationState, TurnReply};

use crate::format::render_answer;

enum ChatControl {
    Continue,
    Exit,
}

fn print_help() {
    println!("Ask anything about the table (e.g. `Which city has the highest D0 conversion rate last 15 days?`).");
    println!("Commands:");
    println!("  reset   forget accumulated filters and memory");
    println!("  state   show the current conversation state");
    println!("  help    this text");
    println!("  exit    quit");
}

fn dispatch_line(agent: &Agent, state: &mut ConversationState, line: &str) -> ChatControl {
    match line {
        "exit" | "quit" => return ChatControl::Exit,
        "help" => {
            print_help();
            return ChatControl::Continue;
        }
        "reset" => {
            *state = ConversationState::default();
            println!("{}", "conversation reset".yellow());
            return ChatControl::Continue;
        }
        "state" => {
            match serde_json::to_string_pretty(state) {
                Ok(text) => println!("{text}"),
                Err(e) => eprintln!("{} {e}", "error:".red().bold()),
            }
            return ChatControl::Continue;
        }
        _ => {}
    }

    let (reply, new_state) = agent.answer(line, state);
    *state = new_state;
    match reply {
        TurnReply::Answer(payload) => {
            println!("\n{}\n", render_answer(line, &payload));
        }
        TurnReply::Failure(err) => {
            println!("{} {}", "assistant:".red().bold(), err.user_message());
        }
    }
    ChatControl::Continue
}

pub fn cmd_chat(agent: Agent) -> Result<()> {
    #[cfg(feature = "repl-rustyline")]
    {
        cmd_chat_rustyline(agent)
    }
    #[cfg(not(feature = "repl-rustyline"))]
    {
        cmd_chat_simple(agent)
    }
}

#[cfg(feature = "repl-rustyline")]
fn cmd_chat_rustyline(agent: Agent) -> Result<()> {
    use rustyline::error::ReadlineError;

    println!("{}", "Tabletalk".green().bold());
    println!("Type `help` for commands. Type `exit` to quit.\n");

    let mut rl = rustyline::DefaultEditor::new()?;
    let mut state = ConversationState::default();

    loop {
        match rl.readline(&"tabletalk> ".cyan().bold().to_string()) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                match dispatch_line(&agent, &mut state, line) {
                    ChatControl::Continue => {}
                    ChatControl::Exit => break,
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{} {e}", "error:".red().bold());
                break;
            }
        }
    }

    Ok(())
}

#[cfg(not(feature = "repl-rustyline"))]
fn cmd_chat_simple(agent: Agent) -> Result<()> {
    use std::io::{self, Write};

    println!("{}", "Tabletalk".green().bold());
    println!("Type `help` for commands. Type `exit` to quit.\n");

    let stdin = io::stdin();
    let mut state = ConversationState::default();

    loop {
        print!("{}", "tabletalk> ".cyan().bold());
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match dispatch_line(&agent, &mut state, line) {
            ChatControl::Continue => {}
            ChatControl::Exit => break,
        }
    }

    Ok(())
}
