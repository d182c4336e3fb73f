//! Mock DAP adapter binary for integration testing
//!
//! Listens on a TCP port, announces it with `Listening on port N` and
//! serves a single client. The simulated program stops twice at line
//! breakpoints in `main` and then exits. Variable references are only
//! valid at the stop that produced them.
//!
//! Flags:
//! - `--port N`: port to listen on (default: any free port)
//! - `--crash`: print an error and exit with code 3 before announcing
//! - `--silent`: never announce the port
//! - `--no-initialized`: never send the `initialized` event

use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};

/// Lines the program stops at, in order
const STOP_LINES: [u32; 2] = [10, 14];

struct Options {
    port: u16,
    crash: bool,
    silent: bool,
    send_initialized: bool,
}

fn parse_args() -> Options {
    let mut options = Options {
        port: 0,
        crash: false,
        silent: false,
        send_initialized: true,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => options.port = args.next().and_then(|p| p.parse().ok()).unwrap_or(0),
            "--crash" => options.crash = true,
            "--silent" => options.silent = true,
            "--no-initialized" => options.send_initialized = false,
            _ => {}
        }
    }
    options
}

fn main() {
    let options = parse_args();
    eprintln!("mock adapter starting");

    if options.crash {
        eprintln!("error: failed to load liblldb");
        std::process::exit(3);
    }

    let listener = TcpListener::bind(("127.0.0.1", options.port)).expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    if options.silent {
        loop {
            std::thread::sleep(std::time::Duration::from_secs(60));
        }
    }

    println!("Listening on port {}", port);
    std::io::stdout().flush().ok();

    let (stream, _) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(_) => return,
    };
    serve(stream, options.send_initialized);
}

fn serve(stream: TcpStream, send_initialized: bool) {
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut writer = stream;
    let mut state = MockState::new(send_initialized);

    while let Some(message) = read_message(&mut reader) {
        for outgoing in state.process_message(&message) {
            if send_message(&mut writer, &outgoing).is_err() {
                return;
            }
        }
        if state.disconnected {
            return;
        }
    }
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let line = line.trim();
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let mut body = vec![0u8; content_length?];
    reader.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn send_message<W: Write>(writer: &mut W, message: &Value) -> std::io::Result<()> {
    let body = message.to_string();
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()
}

fn var(name: &str, value: &str, type_name: &str, reference: i64) -> Value {
    json!({
        "name": name,
        "value": value,
        "type": type_name,
        "variablesReference": reference
    })
}

struct MockState {
    seq: i64,
    send_initialized: bool,
    /// Index into `STOP_LINES` while stopped
    stop: Option<usize>,
    stops_taken: usize,
    exit_code: i64,
    /// Values changed with setVariable at the current stop
    overrides: HashMap<String, String>,
    disconnected: bool,
}

impl MockState {
    fn new(send_initialized: bool) -> Self {
        Self {
            seq: 1,
            send_initialized,
            stop: None,
            stops_taken: 0,
            exit_code: 0,
            overrides: HashMap::new(),
            disconnected: false,
        }
    }

    fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn event(&mut self, event: &str, body: Value) -> Value {
        json!({ "seq": self.next_seq(), "type": "event", "event": event, "body": body })
    }

    /// First reference handed out at the current stop
    fn base(&self) -> Option<i64> {
        self.stop.map(|stop| 1000 + 100 * stop as i64)
    }

    fn local(&self, name: &str, default: String) -> String {
        self.overrides.get(name).cloned().unwrap_or(default)
    }

    fn variables(&self, reference: i64) -> Option<Vec<Value>> {
        let base = self.base()?;
        let stop = self.stop? as i64;
        let vars = match reference - base {
            0 => vec![
                var("a", &self.local("a", (stop + 1).to_string()), "int", 0),
                var("ratio", &self.local("ratio", "2.5".to_string()), "double", 0),
                var("name", &self.local("name", "\"hello\"".to_string()), "&str", 0),
                var("s", &format!("{{x:{}, inner:{{...}}}}", stop + 1), "Point", base + 1),
                var("v", "size=3", "Vec<i32>", base + 3),
            ],
            1 => vec![
                var("x", &(stop + 1).to_string(), "int", 0),
                var("inner", "{...}", "Inner", base + 2),
            ],
            2 => vec![var("deep", "true", "bool", 0)],
            3 => vec![
                var("[0]", "10", "int", 0),
                var("[1]", "20", "int", 0),
                var("[2]", "30", "int", 0),
            ],
            9 => Vec::new(),
            _ => return None,
        };
        Some(vars)
    }

    fn stopped(&mut self, reason: &str) -> Value {
        self.event(
            "stopped",
            json!({ "reason": reason, "threadId": 1, "allThreadsStopped": true }),
        )
    }

    fn evaluate(&self, expression: &str) -> Result<Value, String> {
        let locals = self
            .base()
            .and_then(|base| self.variables(base))
            .ok_or_else(|| "process is running".to_string())?;
        let lookup = |name: &str| {
            locals
                .iter()
                .find(|v| v["name"] == name)
                .cloned()
                .ok_or_else(|| format!("undeclared identifier '{}'", name))
        };

        if let Some((name, addend)) = expression.split_once('+') {
            let left = lookup(name.trim())?;
            let left: i64 = left["value"]
                .as_str()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| format!("invalid operands to '+': {}", expression))?;
            let right: i64 = addend
                .trim()
                .parse()
                .map_err(|_| format!("invalid operands to '+': {}", expression))?;
            return Ok(json!({ "result": (left + right).to_string(), "type": "int", "variablesReference": 0 }));
        }

        let found = lookup(expression.trim())?;
        Ok(json!({
            "result": found["value"],
            "type": found["type"],
            "variablesReference": found["variablesReference"]
        }))
    }

    fn process_message(&mut self, message: &Value) -> Vec<Value> {
        if message.get("type").and_then(Value::as_str) != Some("request") {
            return Vec::new();
        }

        let command = message["command"].as_str().unwrap_or("").to_string();
        let request_seq = message["seq"].as_i64().unwrap_or(0);
        let arguments = message.get("arguments").cloned().unwrap_or(json!({}));

        let mut before = Vec::new();
        let mut after = Vec::new();

        let result: Result<Value, String> = match command.as_str() {
            "initialize" => Ok(json!({
                "supportsConfigurationDoneRequest": true,
                "supportsFunctionBreakpoints": true,
                "supportsConditionalBreakpoints": true,
                "supportsEvaluateForHovers": true,
                "supportsSetVariable": true
            })),
            "launch" | "attach" => {
                if command == "launch" && arguments.get("program").is_none() {
                    Err("No program specified".to_string())
                } else {
                    self.exit_code = arguments["exitCode"].as_i64().unwrap_or(0);
                    // Sent ahead of the response, as some adapters do
                    if self.send_initialized {
                        let initialized = self.event("initialized", json!({}));
                        before.push(initialized);
                    }
                    Ok(Value::Null)
                }
            }
            "setBreakpoints" => {
                let path = arguments["source"]["path"].as_str().unwrap_or("").to_string();
                let breakpoints: Vec<Value> = arguments["breakpoints"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .iter()
                    .enumerate()
                    .map(|(i, bp)| {
                        let line = bp["line"].as_u64().unwrap_or(0);
                        json!({
                            "id": i + 1,
                            "verified": STOP_LINES.contains(&(line as u32)),
                            "line": line,
                            "source": { "path": path }
                        })
                    })
                    .collect();
                Ok(json!({ "breakpoints": breakpoints }))
            }
            "setFunctionBreakpoints" => {
                let count = arguments["breakpoints"].as_array().map(Vec::len).unwrap_or(0);
                let breakpoints: Vec<Value> = (0..count)
                    .map(|i| json!({ "id": 100 + i, "verified": true }))
                    .collect();
                Ok(json!({ "breakpoints": breakpoints }))
            }
            "configurationDone" => {
                // The entry stop comes first and must be ignored by clients
                let initial = self.stopped("initial");
                after.push(initial);
                self.stop = Some(0);
                self.stops_taken = 1;
                let first = self.stopped("breakpoint");
                after.push(first);
                Ok(Value::Null)
            }
            "threads" => Ok(json!({ "threads": [{ "id": 1, "name": "main" }] })),
            "stackTrace" => match self.stop {
                Some(stop) => {
                    let frame_base = 1 + 10 * stop as i64;
                    Ok(json!({
                        "stackFrames": [
                            {
                                "id": frame_base,
                                "name": "main",
                                "source": { "name": "main.rs", "path": "/mock/src/main.rs" },
                                "line": STOP_LINES[stop],
                                "column": 5
                            },
                            { "id": frame_base + 1, "name": "start", "line": 0, "column": 0 }
                        ],
                        "totalFrames": 2
                    }))
                }
                None => Err("process is running".to_string()),
            },
            "scopes" => match (self.stop, self.base()) {
                (Some(stop), Some(base)) => {
                    let frame_base = 1 + 10 * stop as i64;
                    let frame = arguments["frameId"].as_i64().unwrap_or(0);
                    if frame == frame_base {
                        Ok(json!({ "scopes": [
                            { "name": "Local", "variablesReference": base, "expensive": false },
                            { "name": "Static", "variablesReference": 0, "expensive": true }
                        ]}))
                    } else if frame == frame_base + 1 {
                        Ok(json!({ "scopes": [
                            { "name": "Local", "variablesReference": base + 9, "expensive": false }
                        ]}))
                    } else {
                        Err(format!("Invalid frame id {}", frame))
                    }
                }
                _ => Err("process is running".to_string()),
            },
            "variables" => {
                let reference = arguments["variablesReference"].as_i64().unwrap_or(0);
                self.variables(reference)
                    .map(|vars| json!({ "variables": vars }))
                    .ok_or_else(|| "Invalid variable reference".to_string())
            }
            "evaluate" => self.evaluate(arguments["expression"].as_str().unwrap_or("")),
            "setVariable" => {
                let reference = arguments["variablesReference"].as_i64().unwrap_or(0);
                let name = arguments["name"].as_str().unwrap_or("").to_string();
                let value = arguments["value"].as_str().unwrap_or("").to_string();
                match self.base() {
                    Some(base) if reference == base && ["a", "ratio", "name"].contains(&name.as_str()) => {
                        self.overrides.insert(name, value.clone());
                        Ok(json!({ "value": value, "variablesReference": 0 }))
                    }
                    Some(base) if reference == base => Err(format!("Can't set '{}'", name)),
                    _ => Err("Invalid variable reference".to_string()),
                }
            }
            "source" => match arguments["sourceReference"].as_i64() {
                Some(1) => Ok(json!({ "content": "fn main() {\n    let a = 1;\n}\n", "mimeType": "text/x-rust" })),
                _ => Err("Invalid source reference".to_string()),
            },
            "continue" => match self.stop {
                Some(_) => {
                    self.stop = None;
                    self.overrides.clear();
                    if self.stops_taken < STOP_LINES.len() {
                        self.stop = Some(self.stops_taken);
                        self.stops_taken += 1;
                        let stopped = self.stopped("breakpoint");
                        after.push(stopped);
                    } else {
                        let output = self.event("output", json!({ "category": "stdout", "output": "done\n" }));
                        let exited = self.event("exited", json!({ "exitCode": self.exit_code }));
                        let terminated = self.event("terminated", json!({}));
                        after.extend([output, exited, terminated]);
                    }
                    Ok(json!({ "allThreadsContinued": true }))
                }
                None => Err("process is not stopped".to_string()),
            },
            "disconnect" => {
                self.disconnected = true;
                Ok(Value::Null)
            }
            _ => Err(format!("Unknown command: {}", command)),
        };

        let seq = self.next_seq();
        let response = match result {
            Ok(body) => json!({
                "seq": seq,
                "type": "response",
                "request_seq": request_seq,
                "success": true,
                "command": command,
                "body": body
            }),
            Err(message) => json!({
                "seq": seq,
                "type": "response",
                "request_seq": request_seq,
                "success": false,
                "command": command,
                "body": { "error": { "id": 0, "format": message, "showUser": true } }
            }),
        };

        before.push(response);
        before.extend(after);
        before
    }
}
