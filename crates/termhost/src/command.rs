//! Command tree model.
//!
//! A [`CommandRegistry`] holds the top-level [`CommandNode`]s of one
//! session. Nodes may have children (sub-commands of a group) and options;
//! each option carries [`ServiceProviderSlots`] for a completer, validator,
//! converter and activator. Every command and provider is [`Injectable`],
//! so services are injected into the whole tree before the session starts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::inject::Injectable;
use crate::session::SessionId;
use crate::{Error, Result, Window};

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command succeeded.
    Success,
    /// The command failed and already reported why.
    Failure,
    /// The session should end.
    Exit,
}

/// Result of running a command.
pub type CommandResult = Result<CommandOutcome>;

/// An executable command.
#[async_trait]
pub trait Command: Injectable + Send + Sync {
    /// Runs the command.
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult;
}

/// Offers completions for an option value.
pub trait Completer: Injectable + Send + Sync {
    /// Returns candidate values starting with `partial`.
    fn complete(&self, partial: &str) -> Vec<String>;
}

/// Checks an option value.
pub trait Validator: Injectable + Send + Sync {
    /// Returns an error message when `value` is not acceptable.
    fn validate(&self, value: &str) -> std::result::Result<(), String>;
}

/// Rewrites an option value before validation.
pub trait Converter: Injectable + Send + Sync {
    /// Returns the converted value or an error message.
    fn convert(&self, value: &str) -> std::result::Result<String, String>;
}

/// Decides whether an option is available, given the other options present.
pub trait Activator: Injectable + Send + Sync {
    /// Returns true if the option may be used.
    fn is_activated(&self, options: &HashMap<String, String>) -> bool;
}

/// Objects attached to an option, created outside the container.
#[derive(Default)]
pub struct ServiceProviderSlots {
    /// Value completion.
    pub completer: Option<Box<dyn Completer>>,
    /// Value validation.
    pub validator: Option<Box<dyn Validator>>,
    /// Value conversion.
    pub converter: Option<Box<dyn Converter>>,
    /// Availability.
    pub activator: Option<Box<dyn Activator>>,
}

impl ServiceProviderSlots {
    /// Returns how many slots are populated.
    pub fn populated(&self) -> usize {
        usize::from(self.completer.is_some())
            + usize::from(self.validator.is_some())
            + usize::from(self.converter.is_some())
            + usize::from(self.activator.is_some())
    }
}

/// A named option of a command.
pub struct OptionSlot {
    name: String,
    short: Option<char>,
    description: String,
    default_value: Option<String>,
    takes_value: bool,
    required: bool,
    providers: ServiceProviderSlots,
}

impl OptionSlot {
    /// Creates a value-taking option named `--name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            short: None,
            description: String::new(),
            default_value: None,
            takes_value: true,
            required: false,
            providers: ServiceProviderSlots::default(),
        }
    }

    /// Creates a boolean flag named `--name`.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            takes_value: false,
            ..Self::new(name)
        }
    }

    /// Sets the short form `-c`.
    #[must_use]
    pub fn short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }

    /// Sets the help text.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the value used when the option is absent.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Marks the option as mandatory.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Attaches a completer.
    #[must_use]
    pub fn completer(mut self, completer: impl Completer + 'static) -> Self {
        self.providers.completer = Some(Box::new(completer));
        self
    }

    /// Attaches a validator.
    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.providers.validator = Some(Box::new(validator));
        self
    }

    /// Attaches a converter.
    #[must_use]
    pub fn converter(mut self, converter: impl Converter + 'static) -> Self {
        self.providers.converter = Some(Box::new(converter));
        self
    }

    /// Attaches an activator.
    #[must_use]
    pub fn activator(mut self, activator: impl Activator + 'static) -> Self {
        self.providers.activator = Some(Box::new(activator));
        self
    }

    /// Option name without dashes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short form, if any.
    pub fn short_name(&self) -> Option<char> {
        self.short
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.description
    }

    /// Default value, if any.
    pub fn default(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    /// Returns true unless this is a flag.
    pub fn takes_value(&self) -> bool {
        self.takes_value
    }

    /// Returns true if the option is mandatory.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Attached providers.
    pub fn providers(&self) -> &ServiceProviderSlots {
        &self.providers
    }

    /// Attached providers, mutably.
    pub fn providers_mut(&mut self) -> &mut ServiceProviderSlots {
        &mut self.providers
    }
}

impl fmt::Debug for OptionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionSlot")
            .field("name", &self.name)
            .field("short", &self.short)
            .field("takes_value", &self.takes_value)
            .field("providers", &self.providers.populated())
            .finish()
    }
}

/// A command and its options and sub-commands.
pub struct CommandNode {
    name: String,
    description: String,
    command: Box<dyn Command>,
    options: Vec<OptionSlot>,
    children: Vec<CommandNode>,
}

impl CommandNode {
    /// Creates a node.
    pub fn new(name: impl Into<String>, command: impl Command + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: Box::new(command),
            options: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Sets the help text.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds an option.
    #[must_use]
    pub fn option(mut self, option: OptionSlot) -> Self {
        self.options.push(option);
        self
    }

    /// Adds a sub-command.
    #[must_use]
    pub fn child(mut self, child: CommandNode) -> Self {
        self.children.push(child);
        self
    }

    /// Command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Help text.
    pub fn help(&self) -> &str {
        &self.description
    }

    /// The command to run.
    pub fn command(&self) -> &dyn Command {
        self.command.as_ref()
    }

    /// The command to run, mutably.
    pub fn command_mut(&mut self) -> &mut dyn Command {
        self.command.as_mut()
    }

    /// Options.
    pub fn options(&self) -> &[OptionSlot] {
        &self.options
    }

    /// Options, mutably.
    pub fn options_mut(&mut self) -> &mut [OptionSlot] {
        &mut self.options
    }

    /// Finds an option by long or short name.
    pub fn find_option(&self, name: &str) -> Option<&OptionSlot> {
        self.options.iter().find(|o| {
            o.name == name
                || o.short
                    .is_some_and(|s| name.len() == s.len_utf8() && name.starts_with(s))
        })
    }

    /// Sub-commands.
    pub fn children(&self) -> &[CommandNode] {
        &self.children
    }

    /// Sub-commands, mutably.
    pub fn children_mut(&mut self) -> &mut [CommandNode] {
        &mut self.children
    }

    /// Finds a direct sub-command.
    pub fn find_child(&self, name: &str) -> Option<&CommandNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Returns the number of nodes in this subtree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(CommandNode::node_count).sum::<usize>()
    }
}

impl fmt::Debug for CommandNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandNode")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("children", &self.children)
            .finish()
    }
}

/// The commands available to one session.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<CommandNode>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register) that replaces duplicates.
    #[must_use]
    pub fn with(mut self, node: CommandNode) -> Self {
        self.commands.retain(|c| c.name != node.name);
        self.commands.push(node);
        self
    }

    /// Adds a top-level command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if a command with the same name exists.
    pub fn register(&mut self, node: CommandNode) -> Result<()> {
        if self.get(node.name()).is_some() {
            return Err(Error::Registry(format!(
                "command `{}` is already registered",
                node.name()
            )));
        }
        self.commands.push(node);
        Ok(())
    }

    /// Removes a top-level command.
    pub fn remove(&mut self, name: &str) -> Option<CommandNode> {
        let index = self.commands.iter().position(|c| c.name == name)?;
        Some(self.commands.remove(index))
    }

    /// Finds a top-level command.
    pub fn get(&self, name: &str) -> Option<&CommandNode> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// Resolves the deepest node named by the leading words of `words`.
    ///
    /// Returns the node and how many words named it.
    pub fn resolve<S: AsRef<str>>(&self, words: &[S]) -> Option<(&CommandNode, usize)> {
        let first = words.first()?;
        let mut node = self.get(first.as_ref())?;
        let mut used = 1;
        while let Some(word) = words.get(used) {
            match node.find_child(word.as_ref()) {
                Some(child) => {
                    node = child;
                    used += 1;
                }
                None => break,
            }
        }
        Some((node, used))
    }

    /// Top-level command names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.commands.iter().map(CommandNode::name).collect()
    }

    /// Top-level commands.
    pub fn iter(&self) -> impl Iterator<Item = &CommandNode> {
        self.commands.iter()
    }

    /// Top-level commands, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CommandNode> {
        self.commands.iter_mut()
    }

    /// Number of top-level commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// Builds a fresh registry for every session.
pub trait RegistryFactory: Send + Sync {
    /// Builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the commands cannot be constructed; the session is
    /// then closed.
    fn build(&self) -> Result<CommandRegistry>;
}

impl<F> RegistryFactory for F
where
    F: Fn() -> Result<CommandRegistry> + Send + Sync,
{
    fn build(&self) -> Result<CommandRegistry> {
        self()
    }
}

/// Context passed to [`Command::execute`].
pub struct Invocation {
    path: Vec<String>,
    args: Vec<String>,
    options: HashMap<String, String>,
    connection: Arc<dyn Connection>,
    session_id: SessionId,
}

impl Invocation {
    /// Creates an invocation.
    pub fn new(
        path: Vec<String>,
        args: Vec<String>,
        options: HashMap<String, String>,
        connection: Arc<dyn Connection>,
        session_id: SessionId,
    ) -> Self {
        Self {
            path,
            args,
            options,
            connection,
            session_id,
        }
    }

    /// Command path, e.g. `["session", "info"]`.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Positional arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Option value by long name, after conversion and defaults.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Returns true if a flag was given.
    pub fn flag(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// All option values.
    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    /// The session's connection.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// The session id.
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Current terminal size.
    pub fn window(&self) -> Window {
        self.connection.size()
    }

    /// Writes text without a line ending.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed.
    pub fn print(&self, text: &str) -> Result<()> {
        self.connection.write_str(text)
    }

    /// Writes a line, translating `\n` into `\r\n` for the terminal.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed.
    pub fn println(&self, text: &str) -> Result<()> {
        let mut line = text.replace("\r\n", "\n").replace('\n', "\r\n");
        line.push_str("\r\n");
        self.connection.write_str(&line)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("options", &self.options)
            .field("session_id", &self.session_id)
            .finish()
    }
}
