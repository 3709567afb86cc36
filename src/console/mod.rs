//! Minimal interactive console on top of the debugger core.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::{Debugger, EventHook, PlaceDescriptorOwned};
use itertools::Itertools;
use nix::sys::signal::Signal;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const PROMPT: &str = "(gst) ";

/// Hook that renders engine events to the terminal.
#[derive(Default)]
pub struct TerminalHook;

fn render_place(place: &Option<PlaceDescriptorOwned>) -> String {
    match place {
        Some(place) => format!("{}:{}", place.file.display(), place.line_number),
        None => "?".to_string(),
    }
}

impl EventHook for TerminalHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()> {
        println!("hit breakpoint at {pc} ({})", render_place(&place));
        Ok(())
    }

    fn on_step(
        &self,
        pc: RelocatedAddress,
        place: Option<PlaceDescriptorOwned>,
    ) -> anyhow::Result<()> {
        println!("stopped at {pc} ({})", render_place(&place));
        Ok(())
    }

    fn on_signal(&self, signal: Signal) {
        println!("debugee received signal {signal}");
    }

    fn on_exit(&self, code: i32) {
        println!("debugee exited with code {code}");
    }
}

/// Read-eval loop over the canonical command set.
pub struct Console {
    debugger: Debugger,
    editor: DefaultEditor,
}

impl Console {
    pub fn new(debugger: Debugger) -> anyhow::Result<Self> {
        let handle = debugger.manual_stop_handle();
        ctrlc::set_handler(move || handle.request_stop())?;
        Ok(Self {
            debugger,
            editor: DefaultEditor::new()?,
        })
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        loop {
            let line = match self.editor.readline(PROMPT) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            let _ = self.editor.add_history_entry(&line);

            match self.handle_command(&line) {
                Ok(true) => break,
                Ok(false) => {}
                Err(Error::ProcessExited { pid, status }) => {
                    println!("process {pid} exited with status {status}");
                }
                Err(e) => println!("error: {e}"),
            }
        }
        Ok(())
    }

    /// Returns true when the session should end.
    fn handle_command(&mut self, line: &str) -> Result<bool, Error> {
        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or_default();
        let arg = parts.next();

        match cmd {
            "break" | "b" => {
                let loc = arg.ok_or_else(|| Error::LocationNotFound("<empty>".to_string()))?;
                let id = self.debugger.set_breakpoint_at_location(loc)?;
                println!("breakpoint {id} set at {loc}");
            }
            "clear" => {
                let loc = arg.ok_or_else(|| Error::LocationNotFound("<empty>".to_string()))?;
                let bp = self.debugger.clear_breakpoint_at_location(loc)?;
                println!("cleared {bp}");
            }
            "clearall" => {
                self.debugger.clear_all_breakpoints()?;
                println!("all breakpoints cleared");
            }
            "breakpoints" | "bp" => {
                for bp in self.debugger.breakpoints_snapshot() {
                    println!("{bp}");
                }
            }
            "continue" | "c" => self.debugger.continue_execution()?,
            "step" | "s" => self.debugger.step()?,
            "next" | "n" => self.debugger.next()?,
            "threads" => {
                for snap in self.debugger.thread_state() {
                    let marker = if snap.in_focus { "*" } else { " " };
                    println!(
                        "{marker} thread {} {} {}",
                        snap.thread.pid,
                        snap.function.as_deref().unwrap_or("?"),
                        render_place(&snap.place),
                    );
                }
            }
            "thread" => {
                let tid: i32 = arg
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::LocationNotFound("<thread id>".to_string()))?;
                let from = self.debugger.current_thread();
                self.debugger.switch_thread(nix::unistd::Pid::from_raw(tid))?;
                println!("thread context changed from {from} to {tid}");
            }
            "goroutines" => {
                let tasks = self.debugger.goroutines()?;
                for task in tasks.into_iter().sorted_by_key(|t| t.id) {
                    let on_thread = task
                        .thread
                        .map(|tid| format!(" on thread {tid}"))
                        .unwrap_or_default();
                    println!(
                        "goroutine {} [{}]{on_thread} pc={}",
                        task.id,
                        task.status.render(),
                        task.pc,
                    );
                }
            }
            "bt" | "stacktrace" => {
                let depth = arg.and_then(|s| s.parse().ok()).unwrap_or(40);
                let tid = self.debugger.current_thread();
                for frame in self.debugger.backtrace(tid, depth)? {
                    println!(
                        "{} {} ({})",
                        frame.ip,
                        frame.func_name.as_deref().unwrap_or("?"),
                        render_place(&frame.place),
                    );
                }
            }
            "print" | "p" => {
                let name = arg.ok_or_else(|| Error::SymbolNotFound("<empty>".to_string()))?;
                let (addr, bytes) = self.debugger.read_global_variable(name)?;
                println!("{name} at {addr}: {bytes:02x?}");
            }
            "exit" | "quit" | "q" => {
                if self.debugger.exited() {
                    return Ok(true);
                }
                self.debugger.detach(true)?;
                return Ok(true);
            }
            "help" | "h" => {
                println!("commands:");
                println!("  break <loc>    set breakpoint (file:line, function, id, 0xaddr)");
                println!("  clear <loc>    remove breakpoint");
                println!("  clearall       remove all breakpoints");
                println!("  continue       resume the debugee");
                println!("  step           single instruction step");
                println!("  next           step over source line");
                println!("  threads        list threads");
                println!("  thread <id>    switch current thread");
                println!("  goroutines     list tasks");
                println!("  bt [depth]     stack trace of the current thread");
                println!("  print <name>   bytes of a global variable");
                println!("  exit           detach and quit");
            }
            unknown => println!("unknown command `{unknown}`, try `help`"),
        }
        Ok(false)
    }
}
