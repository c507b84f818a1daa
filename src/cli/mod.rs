//! Command-line interface for mongowire
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and CLI overrides
//! - Connection string selection
//! - Running one operation per invocation and printing its documents

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use bson::{Bson, Document};
use tracing::debug;

use crate::client::{Client, ClientOptions};
use crate::config::{Config, LogLevel, parse_uri};
use crate::error::{ExecutionError, MongoWireError, Result};

/// MongoDB wire-protocol client with per-query timeouts
#[derive(Parser, Debug)]
#[command(
    name = "mongowire",
    version,
    about = "MongoDB wire-protocol client with per-query timeouts",
    long_about = "Runs one query or command against a MongoDB server over the legacy wire
protocol. Every read can be bounded with --timeout-ms; a timed-out read leaves
the connection usable."
)]
pub struct CliArgs {
    /// Server URI
    ///
    /// Format: mongodb://[username:password@]host[:port][/database]
    #[arg(long, value_name = "URI")]
    pub uri: Option<String>,

    /// Server to connect to
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Port to connect to
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Database name to use
    #[arg(long, value_name = "NAME")]
    pub database: Option<String>,

    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Client-side read timeout in milliseconds (0 disables)
    #[arg(long, value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,

    /// Connection timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// Skip getlasterror after writes
    #[arg(long)]
    pub unacknowledged: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Quiet mode (minimal output)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Very verbose mode (wire-level logging)
    #[arg(long = "vv")]
    pub very_verbose: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for mongowire
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show version information
    Version,

    /// Query a collection
    Find {
        collection: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,

        /// Maximum documents (negative: single batch)
        #[arg(long, allow_negative_numbers = true)]
        limit: Option<i32>,

        #[arg(long)]
        skip: Option<i32>,

        #[arg(long)]
        batch_size: Option<i32>,

        /// Sort specification as JSON
        #[arg(long, value_name = "JSON")]
        sort: Option<String>,

        /// Projection as JSON
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
    },

    /// Fetch the first matching document
    FindOne {
        collection: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Insert documents given as JSON objects or one JSON array
    Insert {
        collection: String,

        #[arg(value_name = "JSON", required = true)]
        documents: Vec<String>,
    },

    /// Remove matching documents
    Remove {
        collection: String,

        /// Selector as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Count matching documents
    Count {
        collection: String,

        /// Filter as JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Drop a collection
    Drop { collection: String },

    /// Evaluate a server-side script
    Eval {
        code: String,

        /// Script argument as JSON (repeatable)
        #[arg(long = "arg", value_name = "JSON")]
        args: Vec<String>,
    },

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,

        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded configuration
    config: Config,
}

impl CliInterface {
    /// Create a new CLI interface
    ///
    /// # Returns
    /// * `Result<Self>` - New CLI interface or error
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    /// Build from already parsed arguments.
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Load configuration from file and environment, then apply arguments
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load(args.config_file.as_deref())?;

        if let Err(e) = config.validate() {
            eprintln!("Warning: Configuration validation failed: {}", e);
            eprintln!("Using default configuration instead.");
            config = Config::default();
        }

        Self::apply_args_to_config(&mut config, args);
        Ok(config)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the CLI arguments
    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    /// Get the server URI
    ///
    /// Priority:
    /// 1. Explicit --uri
    /// 2. Built from --host / --port
    /// 3. Config default
    pub fn get_connection_uri(&self) -> String {
        if let Some(uri) = &self.args.uri {
            return uri.clone();
        }
        if self.args.host.is_some() || self.args.port.is_some() {
            let host = self.args.host.as_deref().unwrap_or("localhost");
            let port = self.args.port.unwrap_or(27017);
            return format!("mongodb://{host}:{port}");
        }
        self.config.connection.default_uri.clone()
    }

    /// Get the database name to use
    ///
    /// Priority:
    /// 1. --database argument
    /// 2. Database name from connection URI
    /// 3. Default to "test"
    pub fn get_database(&self) -> String {
        if let Some(db) = &self.args.database {
            return db.clone();
        }
        parse_uri(&self.get_connection_uri())
            .ok()
            .and_then(|addr| addr.database)
            .unwrap_or_else(|| "test".to_string())
    }

    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            config.logging.level
        };

        if let Some(timeout) = args.connect_timeout {
            config.connection.connect_timeout = timeout;
        }
        if let Some(timeout) = args.timeout_ms {
            config.query.default_timeout_ms = timeout;
        }
        if args.unacknowledged {
            config.query.acknowledge_writes = false;
        }
    }

    /// Run the selected subcommand
    pub async fn execute(&self) -> Result<()> {
        match &self.args.command {
            Commands::Version => {
                self.show_version();
                Ok(())
            }
            Commands::Config {
                show,
                validate,
                save,
            } => self.handle_config_command(*show, *validate, *save),
            command => {
                let client = self.connect().await?;
                self.run_operation(&client, command).await
            }
        }
    }

    async fn connect(&self) -> Result<Client> {
        let uri = self.get_connection_uri();
        let address = parse_uri(&uri)?.socket_address();
        debug!("Connecting to {}", address);
        Client::connect(&address, ClientOptions::from(&self.config)).await
    }

    async fn run_operation(&self, client: &Client, command: &Commands) -> Result<()> {
        let db = client.database(&self.get_database());

        match command {
            Commands::Find {
                collection,
                filter,
                limit,
                skip,
                batch_size,
                sort,
                fields,
            } => {
                let mut query = db.collection(collection).find(parse_filter(filter.as_deref())?);
                if let Some(limit) = limit {
                    query = query.limit(*limit);
                }
                if let Some(skip) = skip {
                    query = query.skip(*skip);
                }
                if let Some(batch_size) = batch_size {
                    query = query.batch_size(*batch_size);
                }
                if let Some(sort) = sort {
                    query = query.sort(parse_document(sort)?);
                }
                if let Some(fields) = fields {
                    query = query.fields(parse_document(fields)?);
                }

                let mut cursor = query.cursor();
                let mut count = 0usize;
                while let Some(doc) = cursor.get_next().await? {
                    self.print_document(doc)?;
                    count += 1;
                }
                self.print_summary(&format!("{count} document(s) returned"));
            }
            Commands::FindOne { collection, filter } => {
                match db
                    .collection(collection)
                    .find_one(parse_filter(filter.as_deref())?)
                    .await?
                {
                    Some(doc) => self.print_document(doc)?,
                    None => self.print_summary("no document matched"),
                }
            }
            Commands::Insert {
                collection,
                documents,
            } => {
                let docs = parse_documents(documents)?;
                let ids = db.collection(collection).insert_many(docs).await?;
                self.print_value(Bson::Array(ids))?;
            }
            Commands::Remove { collection, filter } => {
                let removed = db
                    .collection(collection)
                    .remove(parse_filter(filter.as_deref())?)
                    .await?;
                match removed {
                    Some(n) => self.print_summary(&format!("{n} document(s) removed")),
                    None => self.print_summary("remove sent"),
                }
            }
            Commands::Count { collection, filter } => {
                let n = db
                    .collection(collection)
                    .count(parse_filter(filter.as_deref())?)
                    .await?;
                println!("{n}");
            }
            Commands::Drop { collection } => {
                if db.collection(collection).drop().await? {
                    self.print_summary(&format!("dropped {collection}"));
                } else {
                    self.print_summary(&format!("{collection} does not exist"));
                }
            }
            Commands::Eval { code, args } => {
                let args = args
                    .iter()
                    .map(String::as_str).map(parse_value)
                    .collect::<Result<Vec<_>>>()?;
                let value = db.eval(code, args).await?;
                self.print_value(value)?;
            }
            Commands::Version | Commands::Config { .. } => {}
        }
        Ok(())
    }

    fn print_document(&self, doc: Document) -> Result<()> {
        self.print_value(Bson::Document(doc))
    }

    fn print_value(&self, value: Bson) -> Result<()> {
        let json = value.into_relaxed_extjson();
        let text = if self.args.pretty {
            serde_json::to_string_pretty(&json)
        } else {
            serde_json::to_string(&json)
        }
        .map_err(|e| MongoWireError::Generic(e.to_string()))?;
        println!("{text}");
        Ok(())
    }

    fn print_summary(&self, message: &str) {
        if !self.args.quiet {
            eprintln!("{message}");
        }
    }

    /// Show version information
    fn show_version(&self) {
        println!("mongowire version {}", env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    }

    fn handle_config_command(&self, show: bool, validate: bool, save: bool) -> Result<()> {
        if validate {
            self.validate_config_file();
        }
        if show {
            self.show_config()?;
        }
        if save {
            let path = self.get_config_path();
            self.config.save(&path)?;
            println!("Configuration saved to {}", path.display());
        }
        Ok(())
    }

    /// Validate configuration file
    fn validate_config_file(&self) {
        let path = self.get_config_path();
        println!("Validating configuration file: {}", path.display());

        if !path.exists() {
            println!("Configuration file does not exist");
            return;
        }

        match Config::from_file(&path) {
            Ok(config) => match config.validate() {
                Ok(_) => println!("Configuration is valid"),
                Err(e) => println!("Configuration validation failed: {}", e),
            },
            Err(e) => println!("Failed to load configuration: {}", e),
        }
    }

    /// Show effective configuration
    fn show_config(&self) -> Result<()> {
        println!("Configuration file: {}", self.get_config_path().display());
        println!();
        let text = toml::to_string_pretty(&self.config)
            .map_err(|e| MongoWireError::Generic(e.to_string()))?;
        println!("{text}");
        Ok(())
    }

    /// Get configuration file path (from args or default)
    fn get_config_path(&self) -> PathBuf {
        self.args
            .config_file
            .clone()
            .unwrap_or_else(Config::default_path)
    }

    /// Read timeout applied to queries, if any.
    pub fn query_timeout(&self) -> Option<Duration> {
        self.config.query.default_timeout()
    }
}

/// Parse a JSON (extended JSON accepted) value.
pub fn parse_value(text: &str) -> Result<Bson> {
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ExecutionError::InvalidParameters(format!("invalid JSON '{text}': {e}")))?;
    Bson::try_from(json)
        .map_err(|e| ExecutionError::InvalidParameters(format!("invalid document '{text}': {e}")).into())
}

/// Parse a JSON object into a document.
pub fn parse_document(text: &str) -> Result<Document> {
    match parse_value(text)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(ExecutionError::InvalidParameters(format!(
            "expected a JSON object, got {other}"
        ))
        .into()),
    }
}

fn parse_filter(text: Option<&str>) -> Result<Document> {
    text.map_or_else(|| Ok(Document::new()), parse_document)
}

/// Objects become one document each; an array contributes each element.
fn parse_documents(texts: &[String]) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for text in texts {
        match parse_value(text)? {
            Bson::Document(doc) => docs.push(doc),
            Bson::Array(items) => {
                for item in items {
                    match item {
                        Bson::Document(doc) => docs.push(doc),
                        other => {
                            return Err(ExecutionError::InvalidParameters(format!(
                                "expected an object in array, got {other}"
                            ))
                            .into());
                        }
                    }
                }
            }
            other => {
                return Err(ExecutionError::InvalidParameters(format!(
                    "expected a JSON object or array, got {other}"
                ))
                .into());
            }
        }
    }
    Ok(docs)
}
