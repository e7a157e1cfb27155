use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use dbgscope_logs::{DbWinNames, DbWinScope, DbWinWriter, Session, SourceHandle};

const SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub const HELP: &str = "\
commands:
  clear            drop all captured messages
  pause            stop shared-memory capture
  resume           restart shared-memory capture
  history <n>      keep at most n messages (0 = unbounded)
  save <path>      write the captured messages to a saved log
  sources          list running sources
  remove <id>      stop a source
  send <text>      write text to the local debug-output buffer
  quit             exit";

/// A console command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Clear,
    Pause,
    Resume,
    History(usize),
    Save(PathBuf),
    Sources,
    Remove(u64),
    Send(String),
    Help,
    Quit,
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        let action = match command {
            "clear" => Action::Clear,
            "pause" => Action::Pause,
            "resume" => Action::Resume,
            "history" => Action::History(
                rest.parse()
                    .with_context(|| format!("invalid history size '{rest}'"))?,
            ),
            "save" if !rest.is_empty() => Action::Save(PathBuf::from(rest)),
            "save" => bail!("save needs a path"),
            "sources" => Action::Sources,
            "remove" => Action::Remove(
                rest.trim_start_matches('#')
                    .parse()
                    .with_context(|| format!("invalid source id '{rest}'"))?,
            ),
            "send" => Action::Send(rest.to_string()),
            "help" | "?" => Action::Help,
            "quit" | "exit" => Action::Quit,
            "" => bail!("empty command"),
            other => bail!("unknown command '{other}', try 'help'"),
        };
        Ok(action)
    }
}

impl Action {
    /// Run the command against the session
    ///
    /// Replies go to stderr so stdout only carries captured messages.
    pub fn apply(self, session: &mut Session, names: &DbWinNames) -> Result<()> {
        match self {
            Action::Clear => session.clear(),
            Action::Pause => session.pause(),
            Action::Resume => {
                let status = session.resume()?;
                if status.global_downgraded {
                    eprintln!("capturing local debug output only");
                }
            }
            Action::History(size) => session.set_history_size(size),
            Action::Save(path) => {
                let count = session.save_log(&path)?;
                eprintln!("saved {count} messages to {}", path.display());
            }
            Action::Sources => {
                for source in session.sources() {
                    eprintln!("{}\t{}\t{}", source.handle, source.source_type, source.description);
                }
            }
            Action::Remove(id) => {
                if !session.remove_source(SourceHandle::from_raw(id)) {
                    bail!("no source #{id}");
                }
            }
            Action::Send(text) => {
                let mut writer = DbWinWriter::open(DbWinScope::Local, names)?;
                if !writer.output(&text, SEND_TIMEOUT)? {
                    bail!("no reader picked up the message");
                }
            }
            Action::Help => eprintln!("{HELP}"),
            Action::Quit => {}
        }
        Ok(())
    }
}
