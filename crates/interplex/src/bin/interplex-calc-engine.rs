//! Reference engine: a tiny integer calculator with process-wide variables.
//!
//! Each line of a job is one statement:
//!
//! ```text
//! x = 1 + 2        assign
//! x * 10           evaluate, result is a text fragment
//! print hello      stream a text fragment
//! html <b>hi</b>   stream an html fragment
//! vars             table of all variables
//! progress 50      report progress
//! sleep 200        wait, honouring cancellation
//! spin 200         block, ignoring cancellation
//! fail message     end the job with an engine error
//! exit 3           terminate the process
//! env NAME         value of an environment variable
//! prop NAME        value of a handshake property
//! pid              process id
//! ```

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use interplex::engine::{Engine, EngineEndpoint, EngineError, EngineJob, EngineServer};
use interplex::protocol::ExecuteReply;
use interplex::types::{Capabilities, Fragment, Table};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "interplex-calc-engine", about = "Calculator engine for interplex", version)]
struct Cli {
    /// Wait this long before connecting back to the host
    #[arg(long, default_value_t = 0)]
    startup_delay_ms: u64,

    /// Present this token instead of the one from the environment
    #[arg(long)]
    token: Option<String>,

    /// Do not advertise cancellation support
    #[arg(long)]
    no_cancel: bool,

    /// Fail to open when this handshake property is missing
    #[arg(long)]
    require_property: Option<String>,
}

struct Calculator {
    capabilities: Capabilities,
    required_property: Option<String>,
    variables: Mutex<HashMap<String, i64>>,
    properties: Mutex<HashMap<String, String>>,
}

impl Calculator {
    fn new(cli: &Cli) -> Self {
        Self {
            capabilities: Capabilities {
                supports_cancel: !cli.no_cancel,
                ..Capabilities::default()
            },
            required_property: cli.require_property.clone(),
            variables: Mutex::new(HashMap::new()),
            properties: Mutex::new(HashMap::new()),
        }
    }

    fn variables(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.variables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evaluate(&self, expr: &str) -> Result<i64, String> {
        let variables = self.variables();
        Evaluator::new(expr, &variables).parse()
    }
}

impl Engine for Calculator {
    fn name(&self) -> &str {
        "calc"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open(&self, properties: &HashMap<String, String>) -> Result<(), EngineError> {
        if let Some(required) = &self.required_property
            && !properties.contains_key(required)
        {
            return Err(EngineError::Open(format!("missing property '{required}'")));
        }
        *self.properties.lock().unwrap_or_else(|e| e.into_inner()) = properties.clone();
        Ok(())
    }

    async fn execute(&self, mut job: EngineJob) -> ExecuteReply {
        debug!(job_id = %job.job_id, context = %job.context, "executing");
        let mut fragments = Vec::new();
        let mut last = None;

        for line in job.code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if job.cancel.is_cancelled() {
                return ExecuteReply::cancelled();
            }
            let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
            let arg = arg.trim();
            match command {
                "print" => job.output.text(arg).await,
                "html" => job.output.fragment(Fragment::Html(arg.to_string())).await,
                "progress" => job.output.progress(arg.parse().unwrap_or(0)).await,
                "vars" => {
                    let mut rows: Vec<Vec<String>> = self
                        .variables()
                        .iter()
                        .map(|(name, value)| vec![name.clone(), value.to_string()])
                        .collect();
                    rows.sort();
                    fragments.push(Fragment::Table(Table {
                        columns: vec!["name".to_string(), "value".to_string()],
                        rows,
                    }));
                }
                "sleep" => {
                    let ms = arg.parse().unwrap_or(0);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        _ = job.cancel.cancelled() => return ExecuteReply::cancelled(),
                    }
                }
                "spin" => {
                    let ms = arg.parse().unwrap_or(0);
                    let _ = tokio::task::spawn_blocking(move || std::thread::sleep(Duration::from_millis(ms))).await;
                }
                "fail" => {
                    let mut reply = ExecuteReply::error(arg);
                    reply.fragments = fragments;
                    return reply;
                }
                "exit" => {
                    let code = arg.parse().unwrap_or(1);
                    error!(code, "exiting on request");
                    eprintln!("calc engine exiting with code {code}");
                    std::process::exit(code);
                }
                "env" => fragments.push(Fragment::text(std::env::var(arg).unwrap_or_default())),
                "prop" => {
                    let properties = self.properties.lock().unwrap_or_else(|e| e.into_inner());
                    fragments.push(Fragment::text(properties.get(arg).cloned().unwrap_or_default()));
                }
                "pid" => fragments.push(Fragment::text(std::process::id().to_string())),
                _ => match assignment(line) {
                    Some((name, expr)) => match self.evaluate(expr) {
                        Ok(value) => {
                            self.variables().insert(name.to_string(), value);
                        }
                        Err(message) => return ExecuteReply::error(message),
                    },
                    None => match self.evaluate(line) {
                        Ok(value) => {
                            fragments.push(Fragment::text(value.to_string()));
                            last = Some(value);
                        }
                        Err(message) => return ExecuteReply::error(message),
                    },
                },
            }
        }

        let reply = ExecuteReply::success(fragments);
        match last {
            Some(value) => reply.with_payload(serde_json::json!({ "value": value })),
            None => reply,
        }
    }
}

/// Splits `name = expr`
fn assignment(line: &str) -> Option<(&str, &str)> {
    let (name, expr) = line.split_once('=')?;
    let name = name.trim();
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some((name, expr.trim()))
}

/// Recursive-descent evaluator over `+ - * / %`, parentheses and variables
struct Evaluator<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
    variables: &'a HashMap<String, i64>,
}

impl<'a> Evaluator<'a> {
    fn new(src: &'a str, variables: &'a HashMap<String, i64>) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
            variables,
        }
    }

    fn parse(mut self) -> Result<i64, String> {
        let value = self.expr()?;
        self.skip_ws();
        match self.chars.peek() {
            None => Ok(value),
            Some(&(_, c)) => Err(format!("unexpected '{c}'")),
        }
    }

    fn skip_ws(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn peek_op(&mut self, ops: &[char]) -> Option<char> {
        self.skip_ws();
        let &(_, c) = self.chars.peek()?;
        ops.contains(&c).then(|| {
            self.chars.next();
            c
        })
    }

    fn expr(&mut self) -> Result<i64, String> {
        let mut value = self.term()?;
        while let Some(op) = self.peek_op(&['+', '-']) {
            let rhs = self.term()?;
            value = match op {
                '+' => value.checked_add(rhs),
                _ => value.checked_sub(rhs),
            }
            .ok_or("integer overflow")?;
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<i64, String> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek_op(&['*', '/', '%']) {
            let rhs = self.factor()?;
            if op != '*' && rhs == 0 {
                return Err("division by zero".to_string());
            }
            value = match op {
                '*' => value.checked_mul(rhs),
                '/' => value.checked_div(rhs),
                _ => value.checked_rem(rhs),
            }
            .ok_or("integer overflow")?;
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<i64, String> {
        if self.peek_op(&['-']).is_some() {
            return self.factor()?.checked_neg().ok_or_else(|| "integer overflow".to_string());
        }
        if self.peek_op(&['(']).is_some() {
            let value = self.expr()?;
            return match self.peek_op(&[')']) {
                Some(_) => Ok(value),
                None => Err("expected ')'".to_string()),
            };
        }

        self.skip_ws();
        let Some(&(start, c)) = self.chars.peek() else {
            return Err("unexpected end of expression".to_string());
        };
        let mut end = start;
        while let Some((i, c)) = self.chars.next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_') {
            end = i + c.len_utf8();
        }
        let token = &self.src[start..end];
        if token.is_empty() {
            return Err(format!("unexpected '{c}'"));
        }
        if c.is_ascii_digit() {
            token.parse().map_err(|_| format!("invalid number '{token}'"))
        } else {
            self.variables
                .get(token)
                .copied()
                .ok_or_else(|| format!("undefined variable '{token}'"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    if cli.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cli.startup_delay_ms)).await;
    }

    let mut endpoint = EngineEndpoint::from_env().context("engine must be launched by an interplex host")?;
    if let Some(token) = &cli.token {
        endpoint.token = token.clone();
    }

    let served = EngineServer::new(Calculator::new(&cli), endpoint).serve().await;
    if let Err(e) = &served {
        error!(error = %e, "engine stopped");
        eprintln!("calc engine: {e}");
    }
    // Blocking `spin` work would otherwise keep the runtime alive.
    std::process::exit(if served.is_ok() { 0 } else { 1 });
}
