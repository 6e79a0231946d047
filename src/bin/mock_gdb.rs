//! Mock gdb binary for integration testing
//!
//! A line-oriented REPL that prints gdb's prompt and reply shapes without
//! a real target. It connects to `mock_sim` on `target extended-remote`
//! and models the three debuggees the suite builds, keyed by image name:
//!
//! - `debug`: spins while `i != 0`, then calls `print_row(length)` ten
//!   times and exits
//! - `regs`: `write_regs` stores every GPR to `data`, then copies fflags
//!   into x1 and stops at `all_done`
//! - `checksum`: CRCs the `data` array from `download_data.c` next to the
//!   image once it has been `load`ed, and passes the result in a0
//!   sign-extended the way the RV64 ABI does
//!
//! SIGINT or a raw ^C on stdin ends a spinning continue; at an idle prompt
//! either one is answered with `Quit` and a fresh prompt.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use harness::gdb::parse_integer;

const PROMPT: &str = "(gdb) ";
const CONTROL_C: u8 = 0x03;
const RESET_VECTOR: u64 = 0x1000;
const ROWS: u64 = 10;

/// Store order of `write_regs`
const GPRS: &[&str] = &[
    "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a1", "a2", "a3", "a4", "a5", "a6",
    "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

const SYMBOLS: &[(&str, u64)] = &[
    ("print_row", 0x10040),
    ("main", 0x10074),
    ("write_regs", 0x10100),
    ("all_done", 0x10180),
    ("data", 0x11000),
];

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_sigint_handler() {
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
}

#[cfg(not(unix))]
fn install_sigint_handler() {}

/// Forward stdin lines to the REPL; a raw ^C byte counts as an interrupt
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin().lock();
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match stdin.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => match byte[0] {
                    CONTROL_C => INTERRUPTED.store(true, Ordering::SeqCst),
                    b'\n' => {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                    b => line.push(b),
                },
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

fn main() {
    install_sigint_handler();

    let lines = spawn_stdin_reader();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut state = MockState::default();

    write!(out, "GNU gdb (mock) 0.1\n{}", PROMPT).ok();
    out.flush().ok();

    loop {
        // An interrupt at an idle prompt is answered like gdb does
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            write!(out, "Quit\n{}", PROMPT).ok();
            out.flush().ok();
        }

        let line = match lines.recv_timeout(Duration::from_millis(10)) {
            Ok(line) => line,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        if line == "quit" || line == "q" {
            break;
        }

        state.execute(&line, &mut out);
        write!(out, "{}", PROMPT).ok();
        out.flush().ok();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    Debug,
    Regs,
    Checksum,
    Other,
}

impl Program {
    fn from_image(path: &Path) -> Self {
        match path.file_stem().and_then(|s| s.to_str()) {
            Some("debug") => Program::Debug,
            Some("regs") => Program::Regs,
            Some("checksum") => Program::Checksum,
            _ => Program::Other,
        }
    }
}

#[derive(Default)]
struct MockState {
    image: Option<PathBuf>,
    connection: Option<TcpStream>,
    loaded: bool,
    history: u64,
    regs: HashMap<String, u64>,
    vars: HashMap<String, u64>,
    memory: HashMap<u64, u64>,
    breakpoints: Vec<String>,
    /// Start of the three-instruction loop `stepi` walks through
    step_base: u64,
    step_index: u64,
    rows: u64,
}

impl MockState {
    fn program(&self) -> Program {
        self.image
            .as_deref()
            .map(Program::from_image)
            .unwrap_or(Program::Other)
    }

    fn reg(&self, name: &str) -> u64 {
        self.regs.get(name).copied().unwrap_or(0)
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs.insert("pc".to_string(), pc);
        self.step_base = pc;
        self.step_index = 0;
    }

    fn execute<W: Write>(&mut self, line: &str, out: &mut W) {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let reply = match command {
            "" | "set" => String::new(),
            "file" => self.file(rest),
            "target" => self.target(rest),
            "p" | "print" => self.print(rest),
            "stepi" | "si" => self.stepi(),
            "b" | "break" => self.break_at(rest),
            "c" | "continue" => {
                if self.connection.is_none() {
                    "The program is not being run.\n".to_string()
                } else {
                    writeln!(out, "Continuing.").ok();
                    out.flush().ok();
                    self.resume()
                }
            }
            "info" => self.info(rest),
            "load" => self.load(),
            _ if command.starts_with("x/") => self.examine(&command[2..], rest),
            _ => format!("Undefined command: \"{}\".  Try \"help\".\n", command),
        };
        write!(out, "{}", reply).ok();
    }

    fn file(&mut self, path: &str) -> String {
        let path = PathBuf::from(path);
        if !path.exists() {
            return format!("{}: No such file or directory.\n", path.display());
        }
        let reply = format!("Reading symbols from {}...\n", path.display());
        self.image = Some(path);
        reply
    }

    fn target(&mut self, rest: &str) -> String {
        let endpoint = rest
            .strip_prefix("extended-remote")
            .or_else(|| rest.strip_prefix("remote"))
            .map(str::trim)
            .unwrap_or(rest);

        let stream = endpoint
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| {
                addrs.find_map(|a| TcpStream::connect_timeout(&a, Duration::from_secs(2)).ok())
            });
        let Some(stream) = stream else {
            return format!("{}: Connection refused.\n", endpoint);
        };

        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
        let mut greeting = String::new();
        let halted = match BufReader::new(&stream).read_line(&mut greeting) {
            Ok(n) if n > 0 => greeting.trim() == "halted",
            _ => return "Remote communication error.  Target disconnected.\n".to_string(),
        };

        self.connection = Some(stream);
        self.vars.insert("i".to_string(), 1);
        self.rows = 0;
        if halted {
            self.set_pc(RESET_VECTOR);
            self.regs.insert("instret".to_string(), 0);
            format!(
                "Remote debugging using {}\n0x{:016x} in ?? ()\n",
                endpoint, RESET_VECTOR
            )
        } else {
            self.set_pc(symbol("main").unwrap_or(0) + 4);
            self.regs.insert("instret".to_string(), 1000);
            format!(
                "Remote debugging using {}\n0x{:016x} in main () at debug.c:12\n12\t  while (i);\n",
                endpoint,
                self.reg("pc")
            )
        }
    }

    fn resolve(&self, expr: &str) -> Option<u64> {
        let expr = expr.trim();
        if let Some((base, offset)) = expr.split_once('+') {
            return Some(self.resolve(base)?.wrapping_add(self.resolve(offset)?));
        }
        if let Some(reg) = expr.strip_prefix('$') {
            if self.connection.is_none() {
                return None;
            }
            return Some(self.reg(register_name(reg)));
        }
        if let Some(value) = self.vars.get(expr) {
            return Some(*value);
        }
        symbol(expr).or_else(|| parse_integer(expr))
    }

    fn print(&mut self, expr: &str) -> String {
        let (target, value) = match expr.split_once('=') {
            Some((lhs, rhs)) => {
                let Some(value) = self.resolve(rhs) else {
                    return unknown_symbol(rhs);
                };
                let lhs = lhs.trim();
                if let Some(reg) = lhs.strip_prefix('$') {
                    if self.connection.is_none() {
                        return "No registers.\n".to_string();
                    }
                    let reg = register_name(reg);
                    if reg == "pc" {
                        self.set_pc(value);
                    } else {
                        self.regs.insert(reg.to_string(), value);
                    }
                } else if self.vars.contains_key(lhs) {
                    self.vars.insert(lhs.to_string(), value);
                } else {
                    return unknown_symbol(lhs);
                }
                (lhs, value)
            }
            None => match self.resolve(expr) {
                Some(value) => (expr, value),
                None if expr.starts_with('$') => return "No registers.\n".to_string(),
                None => return unknown_symbol(expr),
            },
        };

        self.history += 1;
        if target == "$pc" {
            format!("${} = (void (*)()) 0x{:x}\n", self.history, value)
        } else if target.starts_with('$') {
            // Integer registers print as signed longs
            format!("${} = {}\n", self.history, value as i64)
        } else {
            format!("${} = {}\n", self.history, value)
        }
    }

    fn stepi(&mut self) -> String {
        if self.connection.is_none() {
            return "The program is not being run.\n".to_string();
        }
        self.step_index = (self.step_index + 1) % 3;
        let pc = self.step_base + 4 * self.step_index;
        self.regs.insert("pc".to_string(), pc);
        let instret = self.reg("instret") + 1;
        self.regs.insert("instret".to_string(), instret);
        format!("0x{:016x} in ?? ()\n", pc)
    }

    fn break_at(&mut self, location: &str) -> String {
        let Some(addr) = symbol(location) else {
            return format!("Function \"{}\" not defined.\n", location);
        };
        self.breakpoints.push(location.to_string());
        format!(
            "Breakpoint {} at 0x{:x}: file {}, line 7.\n",
            self.breakpoints.len(),
            addr,
            location
        )
    }

    fn breakpoint_number(&self, location: &str) -> Option<usize> {
        self.breakpoints
            .iter()
            .position(|b| b == location)
            .map(|i| i + 1)
    }

    /// Run until a breakpoint, an interrupt or the end of the program
    fn resume(&mut self) -> String {
        match self.program() {
            Program::Debug => {
                if self.vars.get("i").copied().unwrap_or(0) != 0 {
                    return self.spin_until_interrupt();
                }
                match self.breakpoint_number("print_row") {
                    Some(n) if self.rows < ROWS => {
                        let length = self.rows;
                        self.rows += 1;
                        self.set_pc(symbol("print_row").unwrap_or(0));
                        format!(
                            "\nBreakpoint {}, print_row (length={}) at debug.c:7\n7\t  printf(\"%d\\n\", length);\n",
                            n, length
                        )
                    }
                    _ => self.disconnect(),
                }
            }
            Program::Regs => match self.breakpoint_number("all_done") {
                Some(n) if self.reg("pc") == symbol("write_regs").unwrap_or(0) => {
                    let base = self.reg("a0");
                    for (i, reg) in GPRS.iter().enumerate() {
                        self.memory.insert(base + 8 * i as u64, self.reg(reg));
                    }
                    let fflags = self.reg("fflags");
                    self.regs.insert("ra".to_string(), fflags);
                    self.set_pc(symbol("all_done").unwrap_or(0));
                    format!("\nBreakpoint {}, all_done () at regs.S:52\n52\t  j all_done\n", n)
                }
                _ => self.disconnect(),
            },
            Program::Checksum => match self.breakpoint_number("all_done") {
                Some(n) => {
                    let crc = if self.loaded { self.checksum().unwrap_or(0) } else { 0 };
                    // uint32_t arguments are sign-extended into 64-bit registers
                    self.regs.insert("a0".to_string(), crc as i32 as i64 as u64);
                    self.set_pc(symbol("all_done").unwrap_or(0));
                    format!(
                        "\nBreakpoint {}, all_done (crc={}) at checksum.c:20\n20\t}}\n",
                        n, crc
                    )
                }
                None => self.disconnect(),
            },
            Program::Other => self.disconnect(),
        }
    }

    fn spin_until_interrupt(&mut self) -> String {
        while !INTERRUPTED.swap(false, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
            let instret = self.reg("instret") + 100;
            self.regs.insert("instret".to_string(), instret);
        }
        let pc = symbol("main").unwrap_or(0) + 8;
        self.set_pc(pc);
        format!(
            "\nProgram received signal SIGINT, Interrupt.\n0x{:016x} in main () at debug.c:12\n12\t  while (i);\n",
            pc
        )
    }

    fn disconnect(&mut self) -> String {
        self.connection = None;
        "Remote connection closed\n".to_string()
    }

    /// CRC-32 of the `data` array generated next to the image
    fn checksum(&self) -> Option<u32> {
        let dir = self.image.as_deref()?.parent()?;
        let source = std::fs::read_to_string(dir.join("download_data.c")).ok()?;
        let body = source.split_once("data[] = {")?.1.split_once("};")?.0;
        let bytes: Vec<u8> = body
            .split(',')
            .filter_map(|t| {
                let t = t.trim();
                u8::from_str_radix(t.strip_prefix("0x")?, 16).ok()
            })
            .collect();
        Some(checksum_c(&bytes))
    }

    fn examine(&mut self, format: &str, address: &str) -> String {
        let count: usize = format
            .trim_end_matches(|c: char| c.is_ascii_alphabetic())
            .parse()
            .unwrap_or(1);
        let Some(start) = self.resolve(address) else {
            return unknown_symbol(address);
        };
        if self.connection.is_none() {
            return format!("Cannot access memory at address 0x{:x}\n", start);
        }

        let mut reply = String::new();
        for n in 0..count as u64 {
            let addr = start + 8 * n;
            let value = self.memory.get(&addr).copied().unwrap_or(0);
            reply.push_str(&format!(
                "0x{:x} <data+{}>:\t0x{:016x}\n",
                addr,
                addr.saturating_sub(symbol("data").unwrap_or(0)),
                value
            ));
        }
        reply
    }

    fn info(&self, what: &str) -> String {
        if !what.starts_with("registers") && what != "all-registers" {
            return format!("Undefined info command: \"{}\".  Try \"help info\".\n", what);
        }
        if self.connection.is_none() {
            return "The program has no registers now.\n".to_string();
        }

        let mut reply = String::new();
        let names = ["zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a0", "a1"];
        for name in names.iter().chain(["pc"].iter()) {
            let value = if *name == "zero" { 0 } else { self.reg(name) };
            reply.push_str(&format!("{:<15}0x{:<18x}{}\n", name, value, value));
        }
        if what == "all-registers" || what == "registers all" {
            for name in ["fflags", "mscratch", "instret"] {
                let value = self.reg(name);
                reply.push_str(&format!("{:<15}0x{:<18x}{}\n", name, value, value));
            }
        }
        reply
    }

    fn load(&mut self) -> String {
        if self.connection.is_none() {
            return "You can't do that when your target is `exec'\n".to_string();
        }
        let size = self
            .image
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        self.loaded = true;
        format!(
            "Loading section .text, size 0x{:x} lma 0x10000\nStart address 0x10000, load size {}\nTransfer rate: 64 KB/sec, {} bytes/write.\n",
            size, size, size.min(1024)
        )
    }
}

/// Bit-at-a-time CRC-32, the loop `targets/checksum.c` runs
fn checksum_c(buf: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &b in buf {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = (crc >> 1) ^ (0xedb8_8320 & (crc & 1).wrapping_neg());
        }
    }
    !crc
}

/// Canonical name for a register alias
fn register_name(reg: &str) -> &str {
    match reg {
        "x1" => "ra",
        "x2" => "sp",
        "x8" | "s0" => "fp",
        "csr1" => "fflags",
        other => other,
    }
}

fn symbol(name: &str) -> Option<u64> {
    SYMBOLS
        .iter()
        .find(|(sym, _)| *sym == name.trim())
        .map(|(_, addr)| *addr)
}

fn unknown_symbol(expr: &str) -> String {
    format!("No symbol \"{}\" in current context.\n", expr.trim())
}
