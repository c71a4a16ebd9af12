//! Demo commands served by the `termhost` binary.
//!
//! Shows injection into commands (`hello`, `status`) and into option
//! providers (the `--name` completer), plus a command group (`session`).

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use termhost::command::CommandOutcome;
use termhost::injectable;
use termhost::introspection::summarize;
use termhost::prelude::*;

// -----------------------------------------------------------------------------
// Services
// -----------------------------------------------------------------------------

/// Produces greetings.
pub trait Greeter: Send + Sync {
    /// Greets `name`.
    fn greet(&self, name: &str) -> String;
}

/// Default greeter.
#[derive(Debug, Default)]
pub struct FriendlyGreeter;

impl Greeter for FriendlyGreeter {
    fn greet(&self, name: &str) -> String {
        format!("Hello, {name}!")
    }
}

/// Names offered by `hello --name <TAB>`.
#[derive(Debug, Clone)]
pub struct Roster(pub Vec<String>);

/// Session counters of the running transports.
#[derive(Default)]
pub struct HostStatus {
    transports: RwLock<Vec<Arc<dyn TransportSessionInfo>>>,
}

impl HostStatus {
    /// Adds a transport to the report.
    pub fn add(&self, transport: Arc<dyn TransportSessionInfo>) {
        self.transports.write().push(transport);
    }

    /// Current snapshots.
    pub fn snapshot(&self) -> Vec<TransportStatus> {
        let transports = self.transports.read();
        summarize(transports.iter().map(Arc::as_ref))
    }
}

/// Services shared by every session.
pub fn services(status: Arc<HostStatus>) -> Arc<ServiceContainer> {
    let greeter: Arc<dyn Greeter> = Arc::new(FriendlyGreeter);
    let roster = Roster(vec![
        "alice".to_string(),
        "bob".to_string(),
        "carol".to_string(),
    ]);
    Arc::new(
        ServiceContainer::new()
            .with(greeter)
            .with(Arc::new(roster))
            .with(status),
    )
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------

#[derive(Default)]
struct Hello {
    greeter: Inject<dyn Greeter>,
}

injectable!(Hello { greeter });

#[async_trait]
impl Command for Hello {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        let name = invocation.option("name").unwrap_or("world");
        let line = match self.greeter.get() {
            Some(greeter) => greeter.greet(name),
            None => format!("hello {name}"),
        };
        invocation.println(&line)?;
        Ok(CommandOutcome::Success)
    }
}

#[derive(Default)]
struct RosterCompleter {
    roster: Inject<Roster>,
}

injectable!(RosterCompleter { roster });

impl Completer for RosterCompleter {
    fn complete(&self, partial: &str) -> Vec<String> {
        self.roster
            .get()
            .map(|roster| {
                roster
                    .0
                    .iter()
                    .filter(|name| name.starts_with(partial))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct Echo;

injectable!(Echo);

#[async_trait]
impl Command for Echo {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        let text = invocation.args().join(" ");
        invocation.println(&text)?;
        Ok(CommandOutcome::Success)
    }
}

#[derive(Default)]
struct Status {
    status: Inject<HostStatus>,
}

injectable!(Status { status });

#[async_trait]
impl Command for Status {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        let Some(status) = self.status.get() else {
            invocation.println("status unavailable")?;
            return Ok(CommandOutcome::Failure);
        };
        let snapshots = status.snapshot();
        if snapshots.is_empty() {
            invocation.println("no transports running")?;
        }
        for snapshot in snapshots {
            invocation.println(&snapshot.to_string())?;
        }
        Ok(CommandOutcome::Success)
    }
}

struct SessionGroup;

injectable!(SessionGroup);

#[async_trait]
impl Command for SessionGroup {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        invocation.println("usage: session info")?;
        Ok(CommandOutcome::Failure)
    }
}

struct SessionInfoCommand;

injectable!(SessionInfoCommand);

#[async_trait]
impl Command for SessionInfoCommand {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        let window = invocation.window();
        let connection = invocation.connection().clone();
        invocation.println(&format!("id:        {}", invocation.session_id()))?;
        invocation.println(&format!("transport: {}", connection.transport()))?;
        invocation.println(&format!("window:    {}x{}", window.width, window.height))?;
        Ok(CommandOutcome::Success)
    }
}

/// Builds the demo command registry for one session.
///
/// # Errors
///
/// Returns [`Error::Registry`] if two commands share a name.
pub fn registry() -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register(
        CommandNode::new("hello", Hello::default())
            .description("Greet someone")
            .option(
                OptionSlot::new("name")
                    .short('n')
                    .description("Who to greet")
                    .completer(RosterCompleter::default()),
            ),
    )?;
    registry.register(CommandNode::new("echo", Echo).description("Print the arguments"))?;
    registry.register(
        CommandNode::new("status", Status::default()).description("Show session counts"),
    )?;
    registry.register(
        CommandNode::new("session", SessionGroup)
            .description("Session commands")
            .child(
                CommandNode::new("info", SessionInfoCommand)
                    .description("Show this session's id, transport and size"),
            ),
    )?;
    Ok(registry)
}
