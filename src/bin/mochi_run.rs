//! Mochi Process Runner
//!
//! Runs one program with the requested stream redirections and reports how
//! it ended. Options can also come from a JSON config file; command line
//! values win over the file.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use mochi_spawn::{communicate, Captured, EnvPolicy, ProcessStatus, SpawnConfig, WindowSize};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit code when the runner itself fails, as opposed to the child
const RUNNER_FAILURE: u8 = 125;

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args[1..]) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("mochi-run: {}", message);
            eprintln!("Try 'mochi-run --help' for more information.");
            return ExitCode::from(RUNNER_FAILURE);
        },
    };

    if options.show_help {
        print_help();
        return ExitCode::SUCCESS;
    }

    match run(options) {
        Ok(status) => exit_code(status),
        Err(e) => {
            eprintln!("mochi-run: {}", e);
            ExitCode::from(RUNNER_FAILURE)
        },
    }
}

#[derive(Debug, Default)]
struct Options {
    config_file: Option<PathBuf>,
    cli: SpawnConfig,
    json: bool,
    show_help: bool,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();
    let mut i = 0;

    let value = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("option '{}' requires a value", flag))
    };

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-i" | "--stdin" => options.cli.stdin = Some(value(&mut i, arg)?),
            "-o" | "--stdout" => options.cli.stdout = Some(value(&mut i, arg)?),
            "-e" | "--stderr" => options.cli.stderr = Some(value(&mut i, arg)?),
            "-C" | "--cwd" => options.cli.cwd = Some(PathBuf::from(value(&mut i, arg)?)),
            "-c" | "--shell" => options.cli.shell = Some(value(&mut i, arg)?),
            "-f" | "--config" => options.config_file = Some(PathBuf::from(value(&mut i, arg)?)),
            "--env" => {
                let pair = value(&mut i, arg)?;
                let (key, val) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))?;
                options.cli.env.insert(key.to_string(), val.to_string());
            },
            "--clear-env" => options.cli.env_policy = EnvPolicy::Clear,
            "-u" | "--uid" => options.cli.uid = Some(parse_id(&value(&mut i, arg)?, arg)?),
            "-g" | "--gid" => options.cli.gid = Some(parse_id(&value(&mut i, arg)?, arg)?),
            "--pty-size" => {
                let size = value(&mut i, arg)?;
                let size = size.parse::<WindowSize>().map_err(|e| format!("{}", e))?;
                options.cli.pty_size = Some(size);
            },
            "--new-session" => options.cli.new_session = Some(true),
            "--no-new-session" => options.cli.new_session = Some(false),
            "--reset-ids" => options.cli.reset_ids = Some(true),
            "--no-reset-ids" => options.cli.reset_ids = Some(false),
            "--reset-signals" => options.cli.reset_signal_mask = Some(true),
            "--keep-signals" => options.cli.reset_signal_mask = Some(false),
            "-j" | "--json" => options.json = true,
            "-h" | "--help" => options.show_help = true,
            "--" => {
                set_command(&mut options.cli, &args[i + 1..]);
                break;
            },
            _ if arg.starts_with('-') => return Err(format!("unknown option '{}'", arg)),
            _ => {
                set_command(&mut options.cli, &args[i..]);
                break;
            },
        }
        i += 1;
    }

    Ok(options)
}

fn parse_id(value: &str, flag: &str) -> Result<u32, String> {
    value
        .parse()
        .map_err(|_| format!("option '{}' expects a numeric id, got '{}'", flag, value))
}

/// Program and arguments, or extra shell arguments after `--shell`
fn set_command(cli: &mut SpawnConfig, rest: &[String]) {
    if cli.shell.is_some() {
        cli.args = rest.to_vec();
    } else if let Some((program, args)) = rest.split_first() {
        cli.program = Some(PathBuf::from(program));
        cli.args = args.to_vec();
    }
}

fn run(options: Options) -> mochi_spawn::Result<ProcessStatus> {
    let mut config = match &options.config_file {
        Some(path) => SpawnConfig::load(path)?.merge(options.cli),
        None => options.cli,
    };
    if options.json {
        // Capture whatever the caller did not redirect elsewhere
        config.stdin.get_or_insert_with(|| "null".to_string());
        config.stdout.get_or_insert_with(|| "pipe".to_string());
        config.stderr.get_or_insert_with(|| "pipe".to_string());
    }
    tracing::debug!(?config, "resolved spawn config");

    let mut child = config.to_request()?.spawn()?;
    // Nothing is forwarded to a piped stdin: the child sees EOF at once
    drop(child.take_stdin());

    let output = communicate(&mut child);
    let status = child.close(false);
    let (stdout, stderr) = output?;
    let status = status?;

    if options.json {
        let captured = Captured {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };
        let report = serde_json::to_string_pretty(&captured)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        writeln!(io::stdout().lock(), "{}", report)?;
    } else {
        io::stdout().lock().write_all(&stdout)?;
        io::stderr().lock().write_all(&stderr)?;
    }
    Ok(status)
}

/// Mirror the child's fate in our own exit code, shell style
fn exit_code(status: ProcessStatus) -> ExitCode {
    match status {
        ProcessStatus::Exited(code) => ExitCode::from(code as u8),
        ProcessStatus::Signaled(signal, _) => ExitCode::from((128 + signal) as u8),
        ProcessStatus::Running => ExitCode::from(RUNNER_FAILURE),
    }
}

fn print_help() {
    println!(
        r#"mochi-run - spawn a program with explicit stream redirections

USAGE:
    mochi-run [OPTIONS] [--] PROGRAM [ARGS...]
    mochi-run [OPTIONS] --shell COMMAND [ARGS...]

OPTIONS:
    -i, --stdin MODE      Redirection for stdin
    -o, --stdout MODE     Redirection for stdout
    -e, --stderr MODE     Redirection for stderr
    -C, --cwd DIR         Working directory of the child
    -c, --shell COMMAND   Run COMMAND with /bin/sh -c
    -f, --config FILE     Read a JSON spawn config (options here override it)
        --env KEY=VALUE   Set a variable in the child environment
        --clear-env       Start the child with an empty environment
    -u, --uid UID         Run the child as UID
    -g, --gid GID         Run the child with group GID
        --pty-size CxR    Initial PTY size in columns and rows, e.g. 132x43
        --new-session     Make the child a session leader (--no-new-session)
        --reset-ids       Reset effective ids to the real ones (--no-reset-ids)
        --keep-signals    Keep the inherited signal mask and dispositions
        --reset-signals   Reset them (the default)
    -j, --json            Print a JSON report with the captured output;
                          stdin defaults to null, stdout/stderr to pipe
    -h, --help            Show this help message

MODES:
    inherit               Share the runner's stream (default)
    null                  /dev/null
    close                 Leave the slot closed
    pipe                  Pipe to the runner, which copies output to its own
                          stream (stdin gets EOF)
    pty                   A pseudoterminal slave, copied like a pipe
    file:PATH             Read from / truncate PATH
    append:PATH           Append to PATH
    fd:N                  Duplicate the runner's descriptor N

ENVIRONMENT:
    RUST_LOG              Log filter (default: warn)

EXIT STATUS:
    The child's exit code, 128+N if it was killed by signal N, or 125 if
    the runner itself failed.
"#
    );
}
