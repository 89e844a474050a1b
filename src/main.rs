//! Purpose: `fielddb` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Success output is one JSON document on stdout per command.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Predicates only ever come from compiled expressions.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};

use clap::{
    Args, CommandFactory, Parser, Subcommand, ValueEnum, ValueHint,
    error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, json};
use std::error::Error as StdError;

mod color_json;
mod command_dispatch;
mod serve;

use color_json::colorize_json;
use fielddb::api::{
    Durability, Error, ErrorKind, Field, FieldInfo, FieldStore, Groups, JoinMode, Value,
    check_boundary_name, to_exit_code,
};
use fielddb::field_names::default_data_dir;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint(clap_error_hint(&err)),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let data_dir = cli.dir.unwrap_or_else(default_data_dir);
    let color_mode = cli.color;

    command_dispatch::dispatch_command(cli.command, data_dir, color_mode)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "fielddb",
    version,
    about = "Columnar key-value fields with join queries",
    long_about = None,
    before_help = r#"Each field is a key->value mapping stored as one file. Queries join fields by key.

Mental model:
  - `field put` / `field set` write fields
  - `find` returns keys whose per-field values pass an expression
  - `group` buckets those keys by another field's value
"#,
    after_help = r#"EXAMPLES
  $ fielddb field put price '{"k1": 10, "k2": 25}'
  $ fielddb field put color '{"k1": "red"}'
  $ fielddb find price,color --mode outer --where '.[1] == null'
  # {"keys":["k2"]}

  $ fielddb <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        help = "Data directory holding field files (default: ~/.fielddb/fields)",
        value_hint = ValueHint::DirPath
    )]
    dir: Option<PathBuf>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty JSON output: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Write, read, and manage individual fields")]
    Field {
        #[command(subcommand)]
        command: FieldCommand,
    },
    #[command(
        about = "Find keys whose per-field values satisfy an expression",
        after_help = r#"EXAMPLES
  $ fielddb find a,b --where '.[0] > 1'
  $ fielddb find a,b --mode outer --where '.[1] == null'

NOTES
  - The expression sees `[v_a, v_b, ...]` in the listed field order
  - Absent values are `null`; in inner mode every key has all values
  - Any `true` output counts as a match; non-boolean output is an error"#
    )]
    Find {
        #[arg(help = "Comma-separated field names, e.g. price,color")]
        fields: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    #[command(
        about = "Group matching keys by the value of another field",
        after_help = r#"EXAMPLES
  $ fielddb group v --by bucket --where 'reduce .[0][] as $x (0; . + $x) > 2'

NOTES
  - The expression sees `[[v_a...], [v_b...], ...]`, one list per field
  - Keys absent from the --by field form their own `null` group"#
    )]
    Group {
        #[arg(help = "Comma-separated field names, e.g. price,color")]
        fields: String,
        #[arg(long, help = "Field whose value buckets the keys")]
        by: String,
        #[command(flatten)]
        query: QueryArgs,
    },
    #[command(
        about = "Serve fields and queries over HTTP (loopback default)",
        after_help = r#"EXAMPLES
  $ fielddb serve
  $ fielddb serve --bind 127.0.0.1:9810 --token devtoken
  $ curl 'http://127.0.0.1:9810/v0/find/a,b/outer?where=.%5B1%5D%20%3D%3D%20null'

NOTES
  - Non-loopback binds require --allow-non-loopback
  - Non-loopback binds with write access also require --token
  - Use Authorization: Bearer <token> when --token is set"#
    )]
    Serve(ServeArgs),
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
    #[command(about = "Print version info as JSON")]
    Version,
}

#[derive(Subcommand)]
enum FieldCommand {
    #[command(
        about = "Replace a field with the entries of a JSON object",
        after_help = r#"EXAMPLES
  $ fielddb field put price '{"k1": 10, "k2": 25}'
  $ fielddb field put price -f price.json
  $ cat price.json | fielddb field put price"#
    )]
    Put {
        name: String,
        #[arg(help = "Inline JSON object of key -> value")]
        data: Option<String>,
        #[arg(
            short = 'f',
            long = "file",
            help = "Read the JSON object from a file (use - for stdin)",
            conflicts_with = "data",
            value_hint = ValueHint::FilePath
        )]
        file: Option<String>,
        #[arg(long, default_value = "fast", help = "Durability mode: fast|flush")]
        durability: String,
    },
    #[command(about = "Set one key in a field (lock, load, insert, dump)")]
    Set {
        name: String,
        key: String,
        #[arg(help = "JSON value")]
        value: String,
        #[arg(long, default_value = "fast", help = "Durability mode: fast|flush")]
        durability: String,
    },
    #[command(about = "Print a field as a JSON object")]
    Get { name: String },
    #[command(about = "List fields in the data directory")]
    List,
    #[command(about = "Show file metadata for a field")]
    Info { name: String },
    #[command(about = "Delete one or more fields")]
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Args)]
struct QueryArgs {
    #[arg(
        long = "where",
        default_value = "true",
        help = "jq-style boolean expression over the per-field values"
    )]
    expr: String,
    #[arg(long, default_value = "inner", help = "Join mode: inner|outer")]
    mode: String,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AccessModeCli {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl From<AccessModeCli> for serve::AccessMode {
    fn from(value: AccessModeCli) -> Self {
        match value {
            AccessModeCli::ReadOnly => serve::AccessMode::ReadOnly,
            AccessModeCli::WriteOnly => serve::AccessMode::WriteOnly,
            AccessModeCli::ReadWrite => serve::AccessMode::ReadWrite,
        }
    }
}

#[derive(Args)]
struct ServeArgs {
    #[arg(
        long,
        default_value = DEFAULT_BIND,
        help = "Bind address",
        help_heading = "Connection"
    )]
    bind: String,
    #[arg(
        long,
        value_enum,
        default_value = "read-write",
        help = "Access mode: read-only|write-only|read-write",
        help_heading = "Connection"
    )]
    access: AccessModeCli,
    #[arg(long, help = "Bearer token for auth", help_heading = "Authentication")]
    token: Option<String>,
    #[arg(
        long,
        help = "Allow non-loopback binds",
        help_heading = "Safety"
    )]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
}

const DEFAULT_BIND: &str = "127.0.0.1:9810";
const DEFAULT_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;

fn serve_config_from_args(args: ServeArgs, data_dir: &Path) -> Result<serve::ServeConfig, Error> {
    let bind = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_hint("Use a host:port value like 127.0.0.1:9810.")
    })?;
    Ok(serve::ServeConfig {
        bind,
        data_dir: data_dir.to_path_buf(),
        token: args.token,
        access_mode: args.access.into(),
        allow_non_loopback: args.allow_non_loopback,
        max_body_bytes: args.max_body_bytes,
    })
}

fn open_store(data_dir: &Path) -> Result<FieldStore, Error> {
    FieldStore::open(data_dir)
}

fn check_cli_name(name: &str) -> Result<(), Error> {
    check_boundary_name(name).map_err(|err| Error::from(err).with_field(name))
}

fn parse_durability(input: &str) -> Result<Durability, Error> {
    match input.trim() {
        "fast" => Ok(Durability::Fast),
        "flush" => Ok(Durability::Flush),
        _ => Err(Error::new(ErrorKind::Usage)
            .with_message("invalid durability")
            .with_hint("Use fast or flush.")),
    }
}

fn parse_join_mode(input: &str) -> Result<JoinMode, Error> {
    input.parse()
}

fn parse_inline_json(data: &str) -> Result<serde_json::Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_hint("Provide a single JSON value (e.g. '{\"k1\":1}').")
            .with_source(err)
    })
}

fn read_put_input(data: Option<String>, file: Option<String>) -> Result<serde_json::Value, Error> {
    if let Some(data) = data {
        return parse_inline_json(&data);
    }
    let mut raw = String::new();
    match file.as_deref() {
        Some("-") | None => {
            if file.is_none() && io::stdin().is_terminal() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("missing field data")
                    .with_hint("Provide JSON via DATA, --file, or pipe JSON to stdin."));
            }
            io::stdin().read_to_string(&mut raw).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read stdin")
                    .with_source(err)
            })?;
        }
        Some(path) => {
            raw = std::fs::read_to_string(path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read data file")
                    .with_path(path)
                    .with_source(err)
            })?;
        }
    }
    parse_inline_json(&raw)
}

/// Turn a JSON object into a field; keys are record keys, values become `Value`s.
fn field_from_json(value: serde_json::Value) -> Result<Field<String, Value>, Error> {
    match value {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect()),
        other => Err(Error::new(ErrorKind::Usage)
            .with_message("field data must be a JSON object")
            .with_hint(format!(
                "Got {}; wrap entries like '{{\"k1\": 1}}'.",
                json_kind(&other)
            ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn field_entries_json(field: &Field<String, Value>) -> serde_json::Value {
    let mut entries: Vec<(&String, &Value)> = field.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut map = Map::new();
    for (key, value) in entries {
        map.insert(key.clone(), value.to_json());
    }
    serde_json::Value::Object(map)
}

fn field_info_json(info: &FieldInfo) -> serde_json::Value {
    json!({
        "name": info.name,
        "path": info.path.display().to_string(),
        "size_bytes": info.size_bytes,
        "modified": info.modified,
    })
}

fn sorted_keys<I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut keys: Vec<String> = keys.into_iter().collect();
    keys.sort();
    keys
}

fn groups_json(groups: Groups<String, Value>) -> serde_json::Value {
    let mut groups: Vec<(Option<Value>, Vec<String>)> = groups.into_iter().collect();
    groups.sort_by(|a, b| a.0.cmp(&b.0));
    let out: Vec<serde_json::Value> = groups
        .into_iter()
        .map(|(group, keys)| {
            json!({
                "group": group.map_or(serde_json::Value::Null, |value| value.to_json()),
                "keys": sorted_keys(keys),
            })
        })
        .collect();
    serde_json::Value::Array(out)
}

fn add_missing_field_hint(err: Error, name: &str) -> Error {
    if err.kind() != ErrorKind::NotFound || err.hint().is_some() {
        return err;
    }
    err.with_hint(format!(
        "Field `{name}` has no file yet. Create it with `fielddb field put {name} '{{}}'` or check `fielddb field list`."
    ))
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => err.with_hint(
            "Permission denied. Check directory permissions or use --dir to a writable location.",
        ),
        ErrorKind::Busy => {
            err.with_hint("Field is busy (another writer holds the lock). Retry with backoff.")
        }
        ErrorKind::Io => err.with_hint("I/O error. Check the path, filesystem, and disk space."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("Field file appears corrupt. Rewrite it with `fielddb field put` or delete it.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn emit_version_output(color_mode: ColorMode) {
    if io::stdout().is_terminal() {
        println!("fielddb {}", env!("CARGO_PKG_VERSION"));
    } else {
        emit_json(
            json!({
                "name": "fielddb",
                "version": env!("CARGO_PKG_VERSION"),
            }),
            color_mode,
        );
    }
}

fn emit_json(value: serde_json::Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let use_color = color_mode.use_color(is_tty);
    let json = if is_tty || use_color {
        colorize_json(&value, use_color)
    } else {
        serde_json::to_string(&value)
            .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string())
    };
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::NotFound => "not found",
        ErrorKind::AlreadyExists => "already exists",
        ErrorKind::Busy => "resource is busy",
        ErrorKind::Permission => "permission denied",
        ErrorKind::Corrupt => "corrupt data",
        ErrorKind::Io => "i/o error",
        ErrorKind::Config => "configuration error",
        ErrorKind::Predicate => "predicate failed",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> serde_json::Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(field) = err.field() {
        inner.insert("field".to_string(), json!(field));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), serde_json::Value::Object(inner));
    serde_json::Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];

    let label = |name: &str| colorize_label(name, use_color, AnsiColor::Yellow);
    if let Some(hint) = err.hint() {
        lines.push(format!("{} {hint}", label("hint:")));
    }
    if let Some(field) = err.field() {
        lines.push(format!("{} {field}", label("field:")));
    }
    if let Some(path) = err.path() {
        lines.push(format!("{} {}", label("path:"), path.display()));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("{} {cause}", label("caused by:")));
    }

    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let usage = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .map(str::trim);

    let Some(usage) = usage else {
        return "Try `fielddb --help`.".to_string();
    };

    let tokens: Vec<&str> = usage.split_whitespace().collect();
    let Some(pos) = tokens.iter().position(|t| *t == "fielddb") else {
        return "Try `fielddb --help`.".to_string();
    };

    let parts: Vec<&str> = tokens
        .iter()
        .skip(pos + 1)
        .take_while(|token| {
            !token.starts_with('-') && !token.starts_with('<') && !token.starts_with('[')
        })
        .copied()
        .collect();

    if parts.is_empty() {
        return "Try `fielddb --help`.".to_string();
    }
    format!("Try `fielddb {} --help`.", parts.join(" "))
}
