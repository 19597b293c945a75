//! Sample job handlers served by the `stint` binary.
//!
//! - `print` writes `The name is <name>` for a string argument, or the
//!   `message` field of an object argument.
//! - `print-time` writes start and end timestamps around a ten second body.
//!   One runs at a time; it is registered as a per-minute recurring job.
//! - `create-person` simulates a five second insert. One runs at a time.

use async_trait::async_trait;
use chrono::Local;
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::core::handler::{ConcurrencyLimit, HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::scheduler::RecurringJobRequest;

pub const PRINT: &str = "print";
pub const PRINT_TIME: &str = "print-time";
pub const CREATE_PERSON: &str = "create-person";

/// Key of the recurring `print-time` definition.
pub const PRINT_TIME_KEY: &str = "print-time";

const PRINT_TIME_BODY: Duration = Duration::from_secs(10);
const CREATE_PERSON_BODY: Duration = Duration::from_secs(5);
const DEMO_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Where demo handlers write their lines.
#[derive(Clone, Default)]
pub struct Console {
    captured: Option<Arc<Mutex<Vec<String>>>>,
}

impl Console {
    pub fn stdout() -> Self {
        Self::default()
    }

    /// A console that records lines instead of printing them.
    pub fn capture() -> Self {
        Self {
            captured: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn line(&self, line: String) {
        match &self.captured {
            Some(lines) => lines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line),
            None => println!("{}", line),
        }
    }

    /// Lines recorded so far; always empty for stdout.
    pub fn lines(&self) -> Vec<String> {
        self.captured
            .as_ref()
            .map(|lines| lines.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }
}

/// Arguments accepted by `print`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PrintArgs {
    Name(String),
    Message { message: String },
}

impl PrintArgs {
    pub fn text(&self) -> String {
        match self {
            PrintArgs::Name(name) => format!("The name is {}", name),
            PrintArgs::Message { message } => message.clone(),
        }
    }
}

pub struct PrintHandler {
    console: Console,
}

#[async_trait]
impl JobHandler for PrintHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let args: PrintArgs = ctx.arguments()?;
        self.console.line(args.text());
        Ok(())
    }
}

pub struct PrintTimeHandler {
    console: Console,
    body: Duration,
}

#[async_trait]
impl JobHandler for PrintTimeHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        let run = Uuid::new_v4();
        self.console
            .line(format!("Start => {} =>{}", run, Local::now().format("%d/%m/%Y %I:%M:%S %p")));
        tokio::time::sleep(self.body).await;
        self.console
            .line(format!("End => {} =>{}", run, Local::now().format("%d/%m/%Y %I:%M:%S %p")));
        Ok(())
    }
}

pub struct CreatePersonHandler {
    console: Console,
    body: Duration,
}

#[async_trait]
impl JobHandler for CreatePersonHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let name: String = ctx.arguments()?;
        self.console.line(format!("Adding person {}", name));
        tracing::info!(job_id = %ctx.job_id, person = %name, "Adding person");
        tokio::time::sleep(self.body).await;
        self.console.line(format!("Added the person {}", name));
        tracing::info!(job_id = %ctx.job_id, person = %name, "Added person");
        Ok(())
    }
}

/// Demo handlers with adjustable body durations.
pub struct DemoHandlers {
    console: Console,
    print_time_body: Duration,
    create_person_body: Duration,
}

impl Default for DemoHandlers {
    fn default() -> Self {
        Self {
            console: Console::stdout(),
            print_time_body: PRINT_TIME_BODY,
            create_person_body: CREATE_PERSON_BODY,
        }
    }
}

impl DemoHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn with_print_time_body(mut self, body: Duration) -> Self {
        self.print_time_body = body;
        self
    }

    pub fn with_create_person_body(mut self, body: Duration) -> Self {
        self.create_person_body = body;
        self
    }

    /// Register `print`, `print-time` and `create-person`.
    pub fn register(self, registry: &mut HandlerRegistry) {
        registry.register(
            PRINT,
            PrintHandler {
                console: self.console.clone(),
            },
        );
        registry.register_with_limit(
            PRINT_TIME,
            PrintTimeHandler {
                console: self.console.clone(),
                body: self.print_time_body,
            },
            ConcurrencyLimit::exclusive(DEMO_LOCK_TIMEOUT),
        );
        registry.register_with_limit(
            CREATE_PERSON,
            CreatePersonHandler {
                console: self.console,
                body: self.create_person_body,
            },
            ConcurrencyLimit::exclusive(DEMO_LOCK_TIMEOUT),
        );
    }
}

/// The per-minute `print-time` recurring registration.
pub fn print_time_recurring() -> RecurringJobRequest {
    RecurringJobRequest::new(PRINT_TIME_KEY, PRINT_TIME, "@minutely")
}
