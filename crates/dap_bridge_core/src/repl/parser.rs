//! Classification of a jdb-style REPL debugger's text output.
//!
//! The REPL prints unstructured text; these patterns turn it into the
//! structured pieces the bridge needs: prompt boundaries, stop/terminate
//! events, stacks, locals and thread lists.

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint,
    Step,
}

impl StopReason {
    pub fn as_dap(&self) -> &'static str {
        match self {
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplStoppedEvent {
    pub reason: StopReason,
    pub thread_name: String,
    pub thread_id: u64,
    pub class_name: String,
    pub method_name: String,
    pub line: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplStackFrame {
    pub id: u64,
    pub class_name: String,
    pub method_name: String,
    pub file: String,
    pub line: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplVariable {
    pub name: String,
    pub value: String,
    pub type_name: String,
    pub expandable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplThread {
    pub id: u64,
    pub name: String,
    pub state: String,
    pub group: String,
}

pub struct ReplOutputParser {
    breakpoint_hit: Regex,
    step_completed: Regex,
    prompt: Regex,
    frame: Regex,
    native_frame: Regex,
    primitive_local: Regex,
    object_local: Regex,
    null_local: Regex,
    thread_group: Regex,
    thread_line: Regex,
    breakpoint_set: Regex,
    breakpoint_cleared: Regex,
    package_decl: Regex,
}

impl Default for ReplOutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplOutputParser {
    pub fn new() -> Self {
        // The patterns are fixed strings; construction cannot fail.
        Self {
            breakpoint_hit: Regex::new(
                r#"(?i)Breakpoint hit:.*"?thread=([^,"]+)"?[,"].*?\s([\w.]+)\.(\w+)\(\).*?line=(\d+)"#,
            )
            .expect("static pattern"),
            step_completed: Regex::new(
                r#"(?i)Step completed:.*"?thread=([^,"]+)"?[,"].*?\s([\w.]+)\.(\w+)\(\).*?line=(\d+)"#,
            )
            .expect("static pattern"),
            prompt: Regex::new(r"(?m)(>|\w+\[\d+\])\s*$").expect("static pattern"),
            frame: Regex::new(r"\[(\d+)\]\s+([\w.$]+)\.(\w+)\s*\(([^:)]+):(\d+)\)")
                .expect("static pattern"),
            native_frame: Regex::new(r"\[(\d+)\]\s+([\w.$]+)\.(\w+)\s*\(native method\)")
                .expect("static pattern"),
            primitive_local: Regex::new(r"(?m)^\s+(\w+)\s*=\s*([^(\r\n]+?)\s*$").expect("static pattern"),
            object_local: Regex::new(r"(?m)^\s+(\w+)\s*=\s*instance of\s+([\w.$\[\]]+)\s*\(id=(\d+)\)")
                .expect("static pattern"),
            null_local: Regex::new(r"(?m)^\s+(\w+)\s*=\s*null\s*$").expect("static pattern"),
            thread_group: Regex::new(r"(?m)^Group\s+(.+):$").expect("static pattern"),
            thread_line: Regex::new(
                r"\(([^)]+)\)((?:0x)?[0-9a-fA-F]+)\s+(.+?)(?:\s+(running|waiting|suspended|cond\. waiting))?\s*$",
            )
            .expect("static pattern"),
            breakpoint_set: Regex::new(r"(?:Set|Deferring) breakpoint ([\w.$]+):(\d+)")
                .expect("static pattern"),
            breakpoint_cleared: Regex::new(r"Removed: breakpoint ([\w.$]+):(\d+)")
                .expect("static pattern"),
            package_decl: Regex::new(r"(?m)^\s*package\s+([\w.]+)\s*;").expect("static pattern"),
        }
    }

    /// Breakpoint hits and step completions, e.g.
    /// `Breakpoint hit: "thread=main", HelloWorld.main(), line=10 bci=0`.
    pub fn parse_stopped_event(&self, output: &str) -> Option<ReplStoppedEvent> {
        let (reason, captures) = if let Some(captures) = self.breakpoint_hit.captures(output) {
            (StopReason::Breakpoint, captures)
        } else if let Some(captures) = self.step_completed.captures(output) {
            (StopReason::Step, captures)
        } else {
            return None;
        };

        let thread_name = captures[1].trim().to_string();
        Some(ReplStoppedEvent {
            reason,
            thread_id: thread_name_to_id(&thread_name),
            thread_name,
            class_name: captures[2].trim().to_string(),
            method_name: captures[3].trim().to_string(),
            line: captures[4].parse().ok()?,
        })
    }

    /// Whether a chunk of output ends with a command prompt, e.g. `> ` or
    /// `main[1] `.
    pub fn is_prompt(&self, output: &str) -> bool {
        self.prompt.is_match(output)
    }

    pub fn is_vm_started(&self, output: &str) -> bool {
        output.contains("VM Started") || output.contains("VM initialized")
    }

    pub fn is_terminated(&self, output: &str) -> bool {
        output.contains("The application exited")
            || output.contains("application exited")
            || output.contains("VM disconnected")
    }

    /// Frames from a `where` listing, including native frames:
    /// `  [1] HelloWorld.main (HelloWorld.java:10)`.
    pub fn parse_stack_trace(&self, output: &str) -> Vec<ReplStackFrame> {
        let mut frames = Vec::new();
        for line in output.lines() {
            if let Some(captures) = self.frame.captures(line) {
                frames.push(ReplStackFrame {
                    id: captures[1].parse().unwrap_or(0),
                    class_name: captures[2].to_string(),
                    method_name: captures[3].to_string(),
                    file: captures[4].trim().to_string(),
                    line: captures[5].parse().unwrap_or(0),
                });
            } else if let Some(captures) = self.native_frame.captures(line) {
                frames.push(ReplStackFrame {
                    id: captures[1].parse().unwrap_or(0),
                    class_name: captures[2].to_string(),
                    method_name: captures[3].to_string(),
                    file: "<native>".to_string(),
                    line: 0,
                });
            }
        }
        frames
    }

    /// Variables from a `locals` listing.
    pub fn parse_locals(&self, output: &str) -> Vec<ReplVariable> {
        let mut variables = Vec::new();
        for line in output.lines() {
            if line.starts_with("Method arguments:") || line.starts_with("Local variables:") {
                continue;
            }
            if let Some(captures) = self.object_local.captures(line) {
                variables.push(ReplVariable {
                    name: captures[1].to_string(),
                    value: format!("instance of {}", &captures[2]),
                    type_name: captures[2].to_string(),
                    expandable: true,
                });
            } else if let Some(captures) = self.null_local.captures(line) {
                variables.push(ReplVariable {
                    name: captures[1].to_string(),
                    value: "null".to_string(),
                    type_name: "null".to_string(),
                    expandable: false,
                });
            } else if let Some(captures) = self.primitive_local.captures(line) {
                let value = captures[2].trim().to_string();
                variables.push(ReplVariable {
                    name: captures[1].to_string(),
                    type_name: infer_type(&value),
                    value,
                    expandable: false,
                });
            }
        }
        variables
    }

    /// Threads from a `threads` listing; ids may be decimal or hex.
    pub fn parse_threads(&self, output: &str) -> Vec<ReplThread> {
        let mut threads = Vec::new();
        let mut group = String::new();
        for line in output.lines() {
            if let Some(captures) = self.thread_group.captures(line) {
                group = captures[1].trim().to_string();
                continue;
            }
            if let Some(captures) = self.thread_line.captures(line) {
                let raw_id = &captures[2];
                let id = if let Some(hex) = raw_id.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16).unwrap_or(0)
                } else {
                    raw_id.parse().unwrap_or(0)
                };
                threads.push(ReplThread {
                    id,
                    name: captures[3].trim().to_string(),
                    state: captures
                        .get(4)
                        .map(|state| state.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    group: group.clone(),
                });
            }
        }
        threads
    }

    /// Whether `stop at Class:line` output confirms the breakpoint.
    pub fn parse_breakpoint_set(&self, output: &str) -> bool {
        self.breakpoint_set.is_match(output)
    }

    pub fn parse_breakpoint_cleared(&self, output: &str) -> bool {
        self.breakpoint_cleared.is_match(output)
    }

    /// Package declaration from Java source, for building fully-qualified
    /// class names.
    pub fn parse_package_declaration(&self, source: &str) -> Option<String> {
        self.package_decl
            .captures(source)
            .map(|captures| captures[1].to_string())
    }
}

/// Stable synthetic thread id for a REPL thread name; the REPL names
/// threads, DAP wants numbers.
pub fn thread_name_to_id(name: &str) -> u64 {
    if name == "main" {
        return 1;
    }
    // Small stable fold, offset past the reserved main id.
    name.bytes().fold(7u64, |acc, byte| {
        acc.wrapping_mul(31).wrapping_add(byte as u64)
    }) % 100_000
        + 2
}

fn infer_type(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        "int".to_string()
    } else if value.parse::<f64>().is_ok() {
        "double".to_string()
    } else if value == "true" || value == "false" {
        "boolean".to_string()
    } else if value.starts_with('"') {
        "String".to_string()
    } else {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoint_hit_is_a_stopped_event() {
        let parser = ReplOutputParser::new();
        let event = parser
            .parse_stopped_event(
                "Breakpoint hit: \"thread=main\", HelloWorld.main(), line=10 bci=0\n",
            )
            .expect("breakpoint hit parses");
        assert_eq!(event.reason, StopReason::Breakpoint);
        assert_eq!(event.thread_name, "main");
        assert_eq!(event.thread_id, 1);
        assert_eq!(event.class_name, "HelloWorld");
        assert_eq!(event.method_name, "main");
        assert_eq!(event.line, 10);
    }

    #[test]
    fn test_step_completed_is_a_stopped_event() {
        let parser = ReplOutputParser::new();
        let event = parser
            .parse_stopped_event("Step completed: \"thread=worker-1\", Worker.run(), line=25\n")
            .expect("step parses");
        assert_eq!(event.reason, StopReason::Step);
        assert_eq!(event.thread_name, "worker-1");
        assert_eq!(event.line, 25);
    }

    #[test]
    fn test_plain_output_is_not_a_stopped_event() {
        let parser = ReplOutputParser::new();
        assert!(parser.parse_stopped_event("Hello from the program\n").is_none());
    }

    #[test]
    fn test_prompt_detection() {
        let parser = ReplOutputParser::new();
        assert!(parser.is_prompt("> "));
        assert!(parser.is_prompt("main[1] "));
        assert!(parser.is_prompt("some output\nmain[1] "));
        assert!(!parser.is_prompt("Breakpoint hit: something"));
    }

    #[test]
    fn test_terminated_and_vm_started_markers() {
        let parser = ReplOutputParser::new();
        assert!(parser.is_terminated("The application exited\n"));
        assert!(parser.is_terminated("VM disconnected\n"));
        assert!(!parser.is_terminated("still running\n"));
        assert!(parser.is_vm_started("VM Started: No frames on the current call stack\n"));
    }

    #[test]
    fn test_stack_trace_parsing_with_native_frames() {
        let parser = ReplOutputParser::new();
        let frames = parser.parse_stack_trace(
            "  [1] HelloWorld.main (HelloWorld.java:10)\n  [2] sun.reflect.NativeMethodAccessorImpl.invoke0 (native method)\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].class_name, "HelloWorld");
        assert_eq!(frames[0].file, "HelloWorld.java");
        assert_eq!(frames[0].line, 10);
        assert_eq!(frames[1].file, "<native>");
        assert_eq!(frames[1].line, 0);
    }

    #[test]
    fn test_locals_parsing() {
        let parser = ReplOutputParser::new();
        let variables = parser.parse_locals(
            "Method arguments:\n  args = instance of java.lang.String[0] (id=123)\nLocal variables:\n  count = 42\n  message = \"Hello\"\n  obj = null\n",
        );
        assert_eq!(variables.len(), 4);
        assert_eq!(variables[0].name, "args");
        assert!(variables[0].expandable);
        assert_eq!(variables[1].name, "count");
        assert_eq!(variables[1].type_name, "int");
        assert_eq!(variables[2].type_name, "String");
        assert_eq!(variables[3].value, "null");
    }

    #[test]
    fn test_threads_parsing_with_hex_ids_and_groups() {
        let parser = ReplOutputParser::new();
        let threads = parser.parse_threads(
            "Group system:\n  (java.lang.ref.Reference$ReferenceHandler)0x1 Reference Handler\nGroup main:\n  (java.lang.Thread)0x3 main running\n",
        );
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].id, 1);
        assert_eq!(threads[0].group, "system");
        assert_eq!(threads[1].id, 3);
        assert_eq!(threads[1].name, "main");
        assert_eq!(threads[1].state, "running");
    }

    #[test]
    fn test_breakpoint_confirmation() {
        let parser = ReplOutputParser::new();
        assert!(parser.parse_breakpoint_set("Set breakpoint HelloWorld:10\n"));
        assert!(parser.parse_breakpoint_set("Deferring breakpoint com.example.App:3\n"));
        assert!(!parser.parse_breakpoint_set("Unable to set breakpoint\n"));
        assert!(parser.parse_breakpoint_cleared("Removed: breakpoint HelloWorld:10\n"));
    }

    #[test]
    fn test_package_declaration_parsing() {
        let parser = ReplOutputParser::new();
        assert_eq!(
            parser.parse_package_declaration("package com.example.app;\n\npublic class Main {}\n"),
            Some("com.example.app".to_string())
        );
        assert_eq!(parser.parse_package_declaration("public class Main {}\n"), None);
    }

    #[test]
    fn test_thread_name_ids_are_stable_and_distinct_from_main() {
        assert_eq!(thread_name_to_id("main"), 1);
        let worker = thread_name_to_id("worker-1");
        assert_eq!(worker, thread_name_to_id("worker-1"));
        assert_ne!(worker, 1);
    }
}
