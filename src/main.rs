//! Purpose: `poolprobe` CLI entry point.
//! Role: Binary crate root; parses args, loads the profile, runs commands, emits JSON on stdout.
//! Invariants: Commands emit JSON on stdout (compact when piped, pretty on a terminal).
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Dump files are only written under `--in-place`, through a locked mapping.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod color_json;
mod command_dispatch;
mod segment_spec;

use color_json::colorize_json;
use poolprobe::api::{Error, ErrorKind, Profile, to_exit_code};
use segment_spec::{SegmentSpec, parse_address};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }
}

fn main() {
    init_tracing();
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
    let cli = match Cli::try_parse_from(std::env::args_os().collect::<Vec<OsString>>()) {
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
                return Ok(RunOutcome { exit_code });
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

    let color_mode = cli.color;
    let result = load_profile(cli.profile.as_ref())
        .and_then(|profile| command_dispatch::dispatch_command(cli.command, &profile, color_mode));

    result
        .map_err(add_hint)
        .map_err(|err| (err, color_mode))
}

fn load_profile(path: Option<&PathBuf>) -> Result<Profile, Error> {
    let profile = match path {
        Some(path) => Profile::load(path)?,
        None => Profile::builtin()?,
    };
    Ok(profile)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "poolprobe",
    version,
    about = "Resolve slot-pool handles and view host records in memory dumps",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Memory comes from dump files placed at their original addresses with
--segment <base>=<path>. Offsets and layouts come from a profile (built-in by default).
"#,
    after_help = r#"EXAMPLES
  $ poolprobe locate --segment 0x100=header.bin --segment 0x1000=block0.bin 0x100 10
  $ poolprobe release --in-place --segment 0x100=header.bin --segment 0x1000=block0.bin 0x100 10
  $ poolprobe view --segment 0x5000=entrant.bin EntrantData 0x5000
  $ poolprobe bindings --base 0x140000000

LEARN MORE
  $ poolprobe <command> --help
  Log filtering follows RUST_LOG (default: warn), written to stderr."#,
    arg_required_else_help = true,
    disable_help_subcommand = false
)]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Profile JSON describing the host build (default: built-in)",
        value_hint = ValueHint::FilePath
    )]
    profile: Option<PathBuf>,
    #[arg(
        long,
        global = true,
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

#[derive(clap::Args)]
struct DumpArgs {
    #[arg(
        long = "segment",
        value_name = "BASE=PATH",
        help = "Dump file mapped at BASE (repeatable)",
        required = true
    )]
    segments: Vec<SegmentSpec>,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        arg_required_else_help = true,
        about = "Resolve handles to slot addresses without writing",
        after_help = r#"EXAMPLES
  $ poolprobe locate --segment 0x100=header.bin --segment 0x1000=block0.bin 0x100 10 64"#
    )]
    Locate {
        #[command(flatten)]
        dump: DumpArgs,
        #[arg(help = "Pool header address", value_parser = parse_address)]
        pool: u64,
        #[arg(help = "Handles to resolve", required = true, value_parser = parse_address)]
        handles: Vec<u64>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Mark handles' slots free",
        long_about = r#"Resolve handles and set the free bit in each slot's control word.

Without --in-place the write happens on an in-memory copy and only the result is reported.
With --in-place every dump file is mapped writable under an exclusive lock and patched."#
    )]
    Release {
        #[command(flatten)]
        dump: DumpArgs,
        #[arg(long, help = "Write the free bit into the dump files")]
        in_place: bool,
        #[arg(help = "Pool header address", value_parser = parse_address)]
        pool: u64,
        #[arg(help = "Handles to release", required = true, value_parser = parse_address)]
        handles: Vec<u64>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Release a listener registered on a broadcaster"
    )]
    Unlisten {
        #[command(flatten)]
        dump: DumpArgs,
        #[arg(long, help = "Write the free bit into the dump files")]
        in_place: bool,
        #[arg(help = "Broadcaster address", value_parser = parse_address)]
        broadcaster: u64,
        #[arg(help = "Listener handle", value_parser = parse_address)]
        handle: u64,
    },
    #[command(
        arg_required_else_help = true,
        about = "Decode a layout at an address",
        after_help = r#"EXAMPLES
  $ poolprobe view --segment 0x5000=entrant.bin EntrantData 0x5000
  $ poolprobe view --segment 0x5000=entrant.bin EntrantData 0x5000 --field display_name"#
    )]
    View {
        #[command(flatten)]
        dump: DumpArgs,
        #[arg(help = "Layout name from the profile")]
        layout: String,
        #[arg(help = "Record address", value_parser = parse_address)]
        address: u64,
        #[arg(long, help = "Only print these fields or bit fields")]
        field: Vec<String>,
    },
    #[command(
        arg_required_else_help = true,
        about = "Resolve a dispatch table on an object"
    )]
    Dispatch {
        #[command(flatten)]
        dump: DumpArgs,
        #[arg(help = "Dispatch table name from the profile")]
        table: String,
        #[arg(help = "Object address", value_parser = parse_address)]
        object: u64,
    },
    #[command(about = "Print function addresses for a module base")]
    Bindings {
        #[arg(long, help = "Module base address", value_parser = parse_address)]
        base: u64,
        #[arg(long, help = "Only print this function")]
        name: Option<String>,
    },
    #[command(arg_required_else_help = true, about = "Inspect profile layouts")]
    Layout {
        #[command(subcommand)]
        command: LayoutCommand,
    },
    #[command(arg_required_else_help = true, about = "Inspect or check the profile")]
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ poolprobe completion bash > ~/.local/share/bash-completion/completions/poolprobe
  $ poolprobe completion zsh > ~/.zfunc/_poolprobe"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum LayoutCommand {
    #[command(about = "List layout names and sizes")]
    List,
    #[command(about = "Print one layout descriptor")]
    Show {
        #[arg(help = "Layout name")]
        name: String,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    #[command(about = "Print the profile as JSON")]
    Show,
    #[command(about = "Validate geometry, layouts, and dispatch tables")]
    Check,
    #[command(about = "Print the SHA-256 fingerprint of the profile")]
    Fingerprint,
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    let hint = match err.kind() {
        ErrorKind::Fault => "Address is outside every --segment. Add the dump that covers it.",
        ErrorKind::Corrupt => "Pool header looks wrong. Check the pool address and the profile geometry.",
        ErrorKind::Layout => "Fix the profile, then run `poolprobe profile check`.",
        ErrorKind::Busy => "Dump file is locked by another poolprobe process. Retry once it exits.",
        ErrorKind::Permission => "Permission denied. Check the dump file permissions.",
        _ => return err,
    };
    err.with_hint(hint)
}

fn emit_json(value: Value, color_mode: ColorMode) {
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
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Fault => "invalid address".to_string(),
        ErrorKind::Layout => "invalid layout".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
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

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(address) = err.address() {
        inner.insert("address".to_string(), json!(format!("{address:#x}")));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(address) = err.address() {
        lines.push(format!(
            "{} {address:#x}",
            colorize_label("address:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
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
    let command = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: poolprobe"))
        .map(|usage| {
            usage
                .split_whitespace()
                .take_while(|token| !token.starts_with(['-', '<', '[']))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    if command.is_empty() {
        "Try `poolprobe --help`.".to_string()
    } else {
        format!("Try `poolprobe {command} --help`.")
    }
}

#[cfg(test)]
mod tests {
    use super::{Cli, Command, add_hint, clap_error_hint, error_json, error_text};
    use clap::Parser;
    use poolprobe::api::{Error, ErrorKind};

    #[test]
    fn error_json_carries_hex_address() {
        let err = Error::fault(0x9012, 4).with_hint("add a segment");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Fault");
        assert_eq!(value["error"]["address"], "0x9012");
        assert_eq!(value["error"]["hint"], "add a segment");
    }

    #[test]
    fn error_text_defaults_message_by_kind() {
        let text = error_text(&Error::new(ErrorKind::Layout), false);
        assert_eq!(text, "error: invalid layout");
    }

    #[test]
    fn hints_follow_kind_and_keep_existing_ones() {
        let fault = add_hint(Error::fault(0x10, 8));
        assert!(fault.hint().expect("hint").contains("--segment"));
        let kept = add_hint(Error::new(ErrorKind::Busy).with_hint("wait"));
        assert_eq!(kept.hint(), Some("wait"));
        assert!(add_hint(Error::new(ErrorKind::NotFound)).hint().is_none());
    }

    #[test]
    fn clap_hint_names_the_subcommand() {
        let err = match Cli::try_parse_from(["poolprobe", "locate", "--segment", "0x100=h.bin"]) {
            Ok(_) => panic!("missing pool must fail"),
            Err(err) => err,
        };
        assert_eq!(clap_error_hint(&err), "Try `poolprobe locate --help`.");
    }

    #[test]
    fn locate_parses_hex_and_decimal_handles() {
        let cli = Cli::try_parse_from([
            "poolprobe",
            "locate",
            "--segment",
            "0x100=header.bin",
            "0x100",
            "10",
            "0x82",
        ])
        .expect("parse");
        match cli.command {
            Command::Locate { pool, handles, dump } => {
                assert_eq!(pool, 0x100);
                assert_eq!(handles, vec![10, 130]);
                assert_eq!(dump.segments.len(), 1);
            }
            _ => panic!("expected locate"),
        }
    }

    #[test]
    fn locate_requires_a_segment() {
        assert!(Cli::try_parse_from(["poolprobe", "locate", "0x100", "1"]).is_err());
    }
}
