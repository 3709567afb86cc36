use anyhow::Context;
use clap::Parser;
use gostalker::console::{Console, TerminalHook};
use gostalker::debugger::process::Child;
use gostalker::debugger::Debugger;
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Write};

#[derive(Parser)]
#[command(name = "gostalker", version, about = "Debugger for compiled Go programs")]
struct Args {
    /// Path of the program to debug.
    #[arg(required_unless_present = "pid")]
    program: Option<String>,

    /// Arguments passed to the debugee.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Attach to a running process instead of launching one.
    #[arg(long)]
    pid: Option<i32>,
}

fn forward<R: std::io::Read + Send + 'static>(source: R, mut sink: impl Write + Send + 'static) {
    std::thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let _ = writeln!(sink, "{line}");
        }
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
    let (stderr_reader, stderr_writer) = os_pipe::pipe()?;

    let debugger = match args.pid {
        Some(pid) => Debugger::attach(Pid::from_raw(pid), TerminalHook)
            .context("attach to running process")?,
        None => {
            let program = args.program.expect("clap enforces program or pid");
            let child = Child::new(program, args.args, stdout_writer, stderr_writer);
            Debugger::new(child, TerminalHook).context("start debugee")?
        }
    };

    forward(stdout_reader, std::io::stdout());
    forward(stderr_reader, std::io::stderr());

    println!("debugging pid {}, type `help` for commands", debugger.pid());
    Console::new(debugger)?.run()
}
