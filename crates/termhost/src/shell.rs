//! Interpreter capability and the default line-oriented shell.
//!
//! The session runner treats the interpreter as opaque: it hands over a
//! fully injected [`CommandRegistry`] and the session's connection, and the
//! session ends when [`Interpreter::run`] returns.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::command::{CommandNode, CommandOutcome, CommandRegistry, Invocation};
use crate::config::ShellConfig;
use crate::connection::Connection;
use crate::session::SessionId;
use crate::{Error, Result};

/// Name of the built-in command that ends the session.
pub const EXIT_COMMAND: &str = "exit";

/// Name of the built-in command listing registered commands.
pub const HELP_COMMAND: &str = "help";

// -----------------------------------------------------------------------------
// Interpreter
// -----------------------------------------------------------------------------

/// Runs the read/execute/write loop of one session.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Serves `connection` until the client leaves or the connection closes.
    ///
    /// # Errors
    ///
    /// Any error ends the session; the runner logs it and closes the
    /// connection.
    async fn run(
        &self,
        registry: CommandRegistry,
        connection: Arc<dyn Connection>,
        settings: ShellSettings,
        session_id: SessionId,
    ) -> Result<()>;
}

/// Per-session shell settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSettings {
    /// Prompt printed before every line.
    pub prompt: String,
    /// Whether `exit` ends the session when no command of that name exists.
    pub add_exit_command: bool,
    /// Whether typed characters are echoed back.
    pub echo: bool,
    /// Text written once before the first prompt.
    pub welcome: Option<String>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self::from(&ShellConfig::default())
    }
}

impl From<&ShellConfig> for ShellSettings {
    fn from(config: &ShellConfig) -> Self {
        Self {
            prompt: config.prompt.clone(),
            add_exit_command: config.add_exit_command,
            echo: true,
            welcome: None,
        }
    }
}

/// Adjusts the shell settings of every session.
pub trait ShellCustomizer: Send + Sync {
    /// Modifies `settings` in place.
    fn customize(&self, settings: &mut ShellSettings);
}

impl<F> ShellCustomizer for F
where
    F: Fn(&mut ShellSettings) + Send + Sync,
{
    fn customize(&self, settings: &mut ShellSettings) {
        self(settings);
    }
}

// -----------------------------------------------------------------------------
// Line editing
// -----------------------------------------------------------------------------

enum ShellInput {
    Data(Vec<u8>),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EditAction {
    Echo(String),
    Erase,
    Submit(String),
    Interrupt,
    EndOfInput,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escape {
    None,
    Esc,
    Csi,
}

#[derive(Debug)]
struct LineEditor {
    buffer: String,
    escape: Escape,
    last_was_cr: bool,
}

impl LineEditor {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            escape: Escape::None,
            last_was_cr: false,
        }
    }

    fn feed(&mut self, ch: char) -> Option<EditAction> {
        let after_cr = std::mem::take(&mut self.last_was_cr);
        match self.escape {
            Escape::Esc => {
                self.escape = if ch == '[' || ch == 'O' {
                    Escape::Csi
                } else {
                    Escape::None
                };
                return None;
            }
            Escape::Csi => {
                if ('@'..='~').contains(&ch) {
                    self.escape = Escape::None;
                }
                return None;
            }
            Escape::None => {}
        }

        match ch {
            '\x1b' => {
                self.escape = Escape::Esc;
                None
            }
            '\r' => {
                self.last_was_cr = true;
                Some(EditAction::Submit(std::mem::take(&mut self.buffer)))
            }
            '\n' if after_cr => None,
            '\n' => Some(EditAction::Submit(std::mem::take(&mut self.buffer))),
            '\x7f' | '\x08' => self.buffer.pop().map(|_| EditAction::Erase),
            '\x03' => {
                self.buffer.clear();
                Some(EditAction::Interrupt)
            }
            '\x04' if self.buffer.is_empty() => Some(EditAction::EndOfInput),
            '\t' => Some(EditAction::Complete),
            c if c.is_control() => None,
            c => {
                self.buffer.push(c);
                Some(EditAction::Echo(c.to_string()))
            }
        }
    }

    fn insert(&mut self, text: &str) {
        self.buffer.push_str(text);
    }
}

/// Splits a line into words, honoring single quotes, double quotes and
/// backslash escapes.
///
/// # Errors
///
/// Returns a message for an unterminated quote.
pub fn tokenize(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some('"') | None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(ch);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {q} quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

// -----------------------------------------------------------------------------
// Option binding
// -----------------------------------------------------------------------------

/// Splits the words after a command path into positional arguments and
/// option values, then runs each option's activator, converter and validator
/// and applies defaults.
///
/// # Errors
///
/// Returns a message suitable for the terminal.
pub fn bind_arguments(
    node: &CommandNode,
    words: &[String],
) -> std::result::Result<(Vec<String>, HashMap<String, String>), String> {
    let mut args = Vec::new();
    let mut raw: HashMap<String, String> = HashMap::new();
    let mut iter = words.iter();

    while let Some(word) = iter.next() {
        if word == "--" {
            args.extend(iter.by_ref().cloned());
            break;
        }
        let (name, inline) = if let Some(long) = word.strip_prefix("--") {
            match long.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (long, None),
            }
        } else if word.len() > 1 && word.starts_with('-') && !is_number(word) {
            (&word[1..], None)
        } else {
            args.push(word.clone());
            continue;
        };

        let slot = node
            .find_option(name)
            .ok_or_else(|| format!("{}: unknown option {word}", node.name()))?;
        let value = if slot.takes_value() {
            match inline {
                Some(value) => value.to_string(),
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| format!("option --{} requires a value", slot.name()))?,
            }
        } else {
            "true".to_string()
        };
        raw.insert(slot.name().to_string(), value);
    }

    let mut options = HashMap::new();
    for slot in node.options() {
        let providers = slot.providers();
        match raw.get(slot.name()) {
            Some(value) => {
                if let Some(activator) = &providers.activator {
                    if !activator.is_activated(&raw) {
                        return Err(format!("option --{} is not available here", slot.name()));
                    }
                }
                let value = match &providers.converter {
                    Some(converter) => converter
                        .convert(value)
                        .map_err(|e| format!("invalid value for --{}: {e}", slot.name()))?,
                    None => value.clone(),
                };
                if let Some(validator) = &providers.validator {
                    validator
                        .validate(&value)
                        .map_err(|e| format!("invalid value for --{}: {e}", slot.name()))?;
                }
                options.insert(slot.name().to_string(), value);
            }
            None => {
                if let Some(default) = slot.default() {
                    options.insert(slot.name().to_string(), default.to_string());
                } else if slot.is_required() {
                    return Err(format!("missing required option --{}", slot.name()));
                }
            }
        }
    }

    Ok((args, options))
}

fn is_number(word: &str) -> bool {
    word.parse::<f64>().is_ok()
}

// -----------------------------------------------------------------------------
// Completion
// -----------------------------------------------------------------------------

/// Candidates for the last word of `line`.
///
/// Completes command names, sub-command names, `--option` names, and option
/// values through the option's completer.
pub fn completions(
    registry: &CommandRegistry,
    settings: &ShellSettings,
    line: &str,
) -> Vec<String> {
    let mut words: Vec<&str> = line.split_whitespace().collect();
    let partial = if line.ends_with(char::is_whitespace) || line.is_empty() {
        ""
    } else {
        words.pop().unwrap_or("")
    };

    let mut candidates: Vec<String> = if words.is_empty() {
        let mut names: Vec<String> = registry.names().into_iter().map(str::to_string).collect();
        if settings.add_exit_command && registry.get(EXIT_COMMAND).is_none() {
            names.push(EXIT_COMMAND.to_string());
        }
        if registry.get(HELP_COMMAND).is_none() {
            names.push(HELP_COMMAND.to_string());
        }
        names
    } else {
        let Some((node, used)) = registry.resolve(&words) else {
            return Vec::new();
        };
        let value_completion = words
            .last()
            .filter(|_| used < words.len() || node.children().is_empty())
            .and_then(|prev| prev.strip_prefix("--"))
            .and_then(|name| node.find_option(name))
            .filter(|slot| slot.takes_value());

        match value_completion {
            Some(slot) => slot
                .providers()
                .completer
                .as_ref()
                .map(|completer| completer.complete(partial))
                .unwrap_or_default(),
            None => {
                let mut names: Vec<String> = node
                    .options()
                    .iter()
                    .map(|o| format!("--{}", o.name()))
                    .collect();
                if used == words.len() {
                    names.extend(node.children().iter().map(|c| c.name().to_string()));
                }
                names
            }
        }
    };

    candidates.retain(|c| c.starts_with(partial));
    candidates.sort();
    candidates.dedup();
    candidates
}

fn common_prefix(candidates: &[String]) -> &str {
    let Some(first) = candidates.first() else {
        return "";
    };
    let mut end = first.len();
    for candidate in &candidates[1..] {
        end = first
            .char_indices()
            .zip(candidate.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, a), _)| i + a.len_utf8())
            .min(end);
    }
    &first[..end]
}

// -----------------------------------------------------------------------------
// LineShell
// -----------------------------------------------------------------------------

/// Minimal line-oriented interpreter.
///
/// Supports echo, backspace, Ctrl-C (discard line), Ctrl-D on an empty line
/// (leave), Tab completion, quoting, and the `exit` and `help` built-ins.
/// Escape sequences such as arrow keys are ignored.
#[derive(Debug, Clone, Default)]
pub struct LineShell;

impl LineShell {
    /// Creates the shell.
    pub fn new() -> Self {
        Self
    }
}

struct ShellSession<'a> {
    registry: &'a CommandRegistry,
    connection: Arc<dyn Connection>,
    settings: &'a ShellSettings,
    session_id: SessionId,
    editor: LineEditor,
}

impl ShellSession<'_> {
    fn write(&self, text: &str) -> Result<()> {
        self.connection.write_str(text)
    }

    fn prompt(&self) -> Result<()> {
        self.write(&self.settings.prompt)
    }

    fn echo(&self, text: &str) -> Result<()> {
        if self.settings.echo {
            self.write(text)
        } else {
            Ok(())
        }
    }

    /// Returns false once the session should end.
    async fn apply(&mut self, action: EditAction) -> Result<bool> {
        match action {
            EditAction::Echo(text) => self.echo(&text)?,
            EditAction::Erase => self.echo("\x08 \x08")?,
            EditAction::Interrupt => {
                self.write("^C\r\n")?;
                self.prompt()?;
            }
            EditAction::EndOfInput => {
                self.write("\r\n")?;
                return Ok(false);
            }
            EditAction::Complete => self.complete()?,
            EditAction::Submit(line) => {
                self.write("\r\n")?;
                if !self.execute(&line).await? {
                    return Ok(false);
                }
                self.prompt()?;
            }
        }
        Ok(true)
    }

    fn complete(&mut self) -> Result<()> {
        let candidates = completions(self.registry, self.settings, &self.editor.buffer);
        let partial_len = if self.editor.buffer.ends_with(char::is_whitespace) {
            0
        } else {
            self.editor
                .buffer
                .split_whitespace()
                .last()
                .map_or(0, str::len)
        };

        match candidates.as_slice() {
            [] => Ok(()),
            [single] => {
                let mut rest = single[partial_len..].to_string();
                rest.push(' ');
                self.editor.insert(&rest);
                self.echo(&rest)
            }
            _ => {
                let prefix = common_prefix(&candidates);
                if prefix.len() > partial_len {
                    let rest = prefix[partial_len..].to_string();
                    self.editor.insert(&rest);
                    self.echo(&rest)
                } else {
                    self.write(&format!("\r\n{}\r\n", candidates.join("  ")))?;
                    self.prompt()?;
                    self.echo(&self.editor.buffer)
                }
            }
        }
    }

    /// Returns false once the session should end.
    async fn execute(&self, line: &str) -> Result<bool> {
        let words = match tokenize(line) {
            Ok(words) => words,
            Err(message) => {
                self.write(&format!("syntax error: {message}\r\n"))?;
                return Ok(true);
            }
        };
        let Some(name) = words.first() else {
            return Ok(true);
        };

        let Some((node, used)) = self.registry.resolve(&words) else {
            if name == EXIT_COMMAND && self.settings.add_exit_command {
                return Ok(false);
            }
            if name == HELP_COMMAND {
                self.help()?;
            } else {
                self.write(&format!("{name}: command not found\r\n"))?;
            }
            return Ok(true);
        };

        let (args, options) = match bind_arguments(node, &words[used..]) {
            Ok(bound) => bound,
            Err(message) => {
                self.write(&format!("{message}\r\n"))?;
                return Ok(true);
            }
        };

        let path = words[..used].to_vec();
        debug!(
            session_id = %self.session_id,
            command = %path.join(" "),
            args = args.len(),
            "Executing command"
        );
        let mut invocation =
            Invocation::new(path, args, options, self.connection.clone(), self.session_id);
        match node.command().execute(&mut invocation).await {
            Ok(CommandOutcome::Exit) => Ok(false),
            Ok(CommandOutcome::Success | CommandOutcome::Failure) => Ok(true),
            Err(e) if self.connection.is_closed() => Err(e),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Command failed");
                self.write(&format!("error: {e}\r\n"))?;
                Ok(true)
            }
        }
    }

    fn help(&self) -> Result<()> {
        let width = self
            .registry
            .iter()
            .map(|n| n.name().len())
            .max()
            .unwrap_or(0);
        let mut text = String::new();
        for node in self.registry.iter() {
            text.push_str(&format!("  {:width$}  {}\r\n", node.name(), node.help()));
        }
        if self.settings.add_exit_command && self.registry.get(EXIT_COMMAND).is_none() {
            text.push_str(&format!("  {EXIT_COMMAND:width$}  Leave the session\r\n"));
        }
        self.write(&text)
    }
}

#[async_trait]
impl Interpreter for LineShell {
    async fn run(
        &self,
        registry: CommandRegistry,
        connection: Arc<dyn Connection>,
        settings: ShellSettings,
        session_id: SessionId,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input = tx.clone();
        connection.set_stdin_handler(Some(Arc::new(move |data: &[u8]| {
            let _ = input.send(ShellInput::Data(data.to_vec()));
        })));
        connection.set_close_handler(Arc::new(move || {
            let _ = tx.send(ShellInput::Closed);
        }));
        if connection.is_closed() {
            return Ok(());
        }

        let encoding = connection.input_encoding();
        let mut shell = ShellSession {
            registry: &registry,
            connection: connection.clone(),
            settings: &settings,
            session_id,
            editor: LineEditor::new(),
        };

        let result = async {
            if let Some(welcome) = &settings.welcome {
                shell.write(welcome)?;
            }
            shell.prompt()?;

            while let Some(input) = rx.recv().await {
                let ShellInput::Data(data) = input else {
                    break;
                };
                let text = encoding.decode(&data);
                for ch in text.chars() {
                    let Some(action) = shell.editor.feed(ch) else {
                        continue;
                    };
                    if !shell.apply(action).await? {
                        return Ok(());
                    }
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        connection.set_stdin_handler(None);
        match result {
            Err(e) if connection.is_closed() => {
                debug!(session_id = %session_id, error = %e, "Connection closed during write");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandResult, Completer, OptionSlot, Validator};
    use crate::injectable;
    use crate::local::local_pair;
    use crate::{TransportKind, Window};
    use std::time::Duration;

    struct Echo;
    injectable!(Echo);

    #[async_trait]
    impl crate::command::Command for Echo {
        async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
            let mut line = invocation.args().join(" ");
            if let Some(times) = invocation.option("times") {
                line = format!("{line} x{times}");
            }
            invocation.println(&line)?;
            Ok(CommandOutcome::Success)
        }
    }

    struct Colors;
    injectable!(Colors);

    impl Completer for Colors {
        fn complete(&self, partial: &str) -> Vec<String> {
            ["red", "green", "grey"]
                .iter()
                .filter(|c| c.starts_with(partial))
                .map(|c| c.to_string())
                .collect()
        }
    }

    struct Positive;
    injectable!(Positive);

    impl Validator for Positive {
        fn validate(&self, value: &str) -> std::result::Result<(), String> {
            match value.parse::<u32>() {
                Ok(n) if n > 0 => Ok(()),
                _ => Err("must be a positive number".to_string()),
            }
        }
    }

    fn registry() -> CommandRegistry {
        CommandRegistry::new().with(
            CommandNode::new("echo", Echo)
                .description("Print arguments")
                .option(OptionSlot::new("color").completer(Colors))
                .option(OptionSlot::new("times").short('n').validator(Positive))
                .child(CommandNode::new("loud", Echo)),
        )
    }

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("  a  b ").unwrap(), vec!["a", "b"]);
        assert_eq!(
            tokenize(r#"say "hello world" 'x y'"#).unwrap(),
            vec!["say", "hello world", "x y"]
        );
        assert_eq!(tokenize(r"a\ b").unwrap(), vec!["a b"]);
        assert_eq!(tokenize(r#""""#).unwrap(), vec![""]);
        assert!(tokenize("\"open").is_err());
    }

    #[test]
    fn test_line_editor() {
        let mut editor = LineEditor::new();
        for ch in "ab".chars() {
            editor.feed(ch);
        }
        assert_eq!(editor.feed('\x7f'), Some(EditAction::Erase));
        assert_eq!(editor.feed('\r'), Some(EditAction::Submit("a".to_string())));
        assert_eq!(editor.feed('\n'), None);
        assert_eq!(editor.feed('\n'), Some(EditAction::Submit(String::new())));
        assert_eq!(editor.feed('\x7f'), None);
        assert_eq!(editor.feed('\x04'), Some(EditAction::EndOfInput));
    }

    #[test]
    fn test_line_editor_skips_escape_sequences() {
        let mut editor = LineEditor::new();
        for ch in "\x1b[A\x1b[1;5Cx".chars() {
            editor.feed(ch);
        }
        assert_eq!(editor.buffer, "x");
    }

    #[test]
    fn test_bind_arguments() {
        let registry = registry();
        let node = registry.get("echo").unwrap();
        let words: Vec<String> = ["hi", "--times=3", "-n", "2", "--", "--raw"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (args, options) = bind_arguments(node, &words).unwrap();
        assert_eq!(args, vec!["hi", "--raw"]);
        assert_eq!(options.get("times").map(String::as_str), Some("2"));

        let bad = vec!["--times".to_string(), "0".to_string()];
        assert!(bind_arguments(node, &bad).unwrap_err().contains("positive"));
        assert!(bind_arguments(node, &["--nope".to_string()]).is_err());
        assert!(bind_arguments(node, &["--color".to_string()]).is_err());
    }

    #[test]
    fn test_completions() {
        let registry = registry();
        let settings = ShellSettings::default();
        assert_eq!(completions(&registry, &settings, "e"), vec!["echo", "exit"]);
        assert_eq!(completions(&registry, &settings, "echo --c"), vec!["--color"]);
        assert_eq!(completions(&registry, &settings, "echo --color gr"), vec!["green", "grey"]);
        assert_eq!(completions(&registry, &settings, "echo l"), vec!["loud"]);
        assert!(completions(&registry, &settings, "nothing ").is_empty());
    }

    #[test]
    fn test_common_prefix() {
        let candidates = vec!["green".to_string(), "grey".to_string()];
        assert_eq!(common_prefix(&candidates), "gre");
        assert_eq!(common_prefix(&[]), "");
    }

    #[tokio::test]
    async fn test_line_shell_runs_commands_until_exit() {
        let (conn, mut client) = local_pair(TransportKind::Local, Window::default());
        let task = tokio::spawn(async move {
            LineShell::new()
                .run(registry(), conn, ShellSettings::default(), SessionId::new())
                .await
        });

        client.read_until("[termhost]$ ", WAIT).await.unwrap();
        client.send_line("echo hello 'big world' -n 2");
        let output = client.read_until("[termhost]$ ", WAIT).await.unwrap();
        assert!(output.contains("hello big world x2\r\n"));

        client.send_line("bogus");
        let output = client.read_until("[termhost]$ ", WAIT).await.unwrap();
        assert!(output.contains("bogus: command not found"));

        client.send_line("exit");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_line_shell_tab_completion() {
        let (conn, mut client) = local_pair(TransportKind::Local, Window::default());
        let task = tokio::spawn(async move {
            LineShell::new()
                .run(registry(), conn, ShellSettings::default(), SessionId::new())
                .await
        });

        client.read_until("[termhost]$ ", WAIT).await.unwrap();
        client.send("ec\tok\r");
        let output = client.read_until("[termhost]$ ", WAIT).await.unwrap();
        assert!(output.contains("echo ok\r\nok\r\n"));

        client.send("\x04");
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_line_shell_returns_when_connection_closes() {
        let (conn, mut client) = local_pair(TransportKind::Local, Window::default());
        let task = tokio::spawn(async move {
            LineShell::new()
                .run(registry(), conn, ShellSettings::default(), SessionId::new())
                .await
        });

        client.read_until("[termhost]$ ", WAIT).await.unwrap();
        client.close();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }
}
