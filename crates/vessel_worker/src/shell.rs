//! Builtin shell executor.
//!
//! Runs a single command against the virtual filesystem. No pipes,
//! redirection, or job control; unknown commands never reach this
//! executor because `matches` only claims the builtin set.

use std::time::Duration;
use vessel_protocol::defaults::EXIT_CODE_TERMINATED;
use vessel_protocol::{paths, ProcessKind};

use crate::executor::{ExecContext, ExecFuture, Executor};

const BUILTINS: &[&str] = &[
    "echo", "cat", "ls", "pwd", "mkdir", "rm", "touch", "sleep", "env", "true", "false",
];

pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Shell
    }

    fn matches(&self, command: &str) -> bool {
        BUILTINS.contains(&command)
    }

    fn launch(&self, ctx: ExecContext) -> ExecFuture {
        Box::pin(run(ctx))
    }
}

async fn run(mut ctx: ExecContext) -> i32 {
    let cancel = ctx.cancel.clone();
    tokio::select! {
        _ = cancel.cancelled() => EXIT_CODE_TERMINATED,
        code = execute(&mut ctx) => code,
    }
}

async fn execute(ctx: &mut ExecContext) -> i32 {
    match ctx.command.as_str() {
        "echo" => {
            ctx.events
                .output(ctx.pid, format!("{}\n", ctx.args.join(" ")), false);
            0
        }
        "pwd" => {
            ctx.events.output(ctx.pid, format!("{}\n", ctx.cwd), false);
            0
        }
        "true" => 0,
        "false" => 1,
        "env" => {
            let mut vars: Vec<_> = ctx.env.iter().collect();
            vars.sort_by_key(|(key, _)| key.as_str());
            for (key, value) in vars {
                ctx.events
                    .output(ctx.pid, format!("{}={}\n", key, value), false);
            }
            0
        }
        "sleep" => sleep(ctx).await,
        "cat" => cat(ctx).await,
        "ls" => ls(ctx),
        "mkdir" => mkdir(ctx),
        "rm" => rm(ctx),
        "touch" => touch(ctx),
        other => {
            // Unreachable through the registry; kept for direct callers.
            ctx.events
                .output(ctx.pid, format!("{}: command not found\n", other), true);
            127
        }
    }
}

async fn sleep(ctx: &mut ExecContext) -> i32 {
    let Some(spec) = ctx.args.first() else {
        ctx.events
            .output(ctx.pid, "sleep: missing operand\n", true);
        return 1;
    };
    match spec.parse::<f64>() {
        Ok(secs) if secs >= 0.0 => {
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            0
        }
        _ => {
            ctx.events.output(
                ctx.pid,
                format!("sleep: invalid time interval '{}'\n", spec),
                true,
            );
            1
        }
    }
}

async fn cat(ctx: &mut ExecContext) -> i32 {
    if ctx.args.is_empty() {
        // Echo stdin until the process is torn down.
        while let Some(line) = ctx.stdin.recv().await {
            ctx.events.output(ctx.pid, line, false);
        }
        return 0;
    }
    let mut code = 0;
    for arg in &ctx.args {
        let path = paths::join(&ctx.cwd, arg);
        let result = {
            let fs = ctx.fs.lock().expect("filesystem poisoned");
            fs.read_file(&path)
        };
        match result {
            Ok(content) => ctx.events.output(ctx.pid, content, false),
            Err(err) => {
                ctx.events
                    .output(ctx.pid, format!("cat: {}\n", err), true);
                code = 1;
            }
        }
    }
    code
}

fn ls(ctx: &ExecContext) -> i32 {
    let target = ctx.args.first().map(String::as_str).unwrap_or(".");
    let path = paths::join(&ctx.cwd, target);
    let fs = ctx.fs.lock().expect("filesystem poisoned");
    if fs.is_dir(&path) {
        match fs.list_directory(&path) {
            Ok(entries) => {
                if !entries.is_empty() {
                    ctx.events
                        .output(ctx.pid, format!("{}\n", entries.join("\n")), false);
                }
                0
            }
            Err(err) => {
                ctx.events.output(ctx.pid, format!("ls: {}\n", err), true);
                1
            }
        }
    } else if fs.exists(&path) {
        let name = paths::file_name(&path).unwrap_or_else(|| path.clone());
        ctx.events.output(ctx.pid, format!("{}\n", name), false);
        0
    } else {
        ctx.events.output(
            ctx.pid,
            format!("ls: cannot access '{}': No such file or directory\n", target),
            true,
        );
        1
    }
}

fn mkdir(ctx: &ExecContext) -> i32 {
    let parents = ctx.args.iter().any(|arg| arg == "-p");
    let operands: Vec<_> = ctx.args.iter().filter(|arg| !arg.starts_with('-')).collect();
    if operands.is_empty() {
        ctx.events
            .output(ctx.pid, "mkdir: missing operand\n", true);
        return 1;
    }
    let mut code = 0;
    let mut fs = ctx.fs.lock().expect("filesystem poisoned");
    for operand in operands {
        let path = paths::join(&ctx.cwd, operand);
        let result = if parents {
            fs.create_dir_all(&path)
        } else {
            fs.create_directory(&path)
        };
        if let Err(err) = result {
            ctx.events.output(
                ctx.pid,
                format!("mkdir: cannot create directory '{}': {}\n", operand, err),
                true,
            );
            code = 1;
        }
    }
    code
}

fn rm(ctx: &ExecContext) -> i32 {
    let mut recursive = false;
    let mut force = false;
    let mut operands = Vec::new();
    for arg in &ctx.args {
        match arg.as_str() {
            "-r" | "-R" => recursive = true,
            "-f" => force = true,
            "-rf" | "-fr" => {
                recursive = true;
                force = true;
            }
            _ => operands.push(arg),
        }
    }
    if operands.is_empty() {
        ctx.events.output(ctx.pid, "rm: missing operand\n", true);
        return 1;
    }
    let mut code = 0;
    let mut fs = ctx.fs.lock().expect("filesystem poisoned");
    for operand in operands {
        let path = paths::join(&ctx.cwd, operand);
        if let Err(err) = fs.delete_file(&path, recursive) {
            if !force {
                ctx.events.output(
                    ctx.pid,
                    format!("rm: cannot remove '{}': {}\n", operand, err),
                    true,
                );
                code = 1;
            }
        }
    }
    code
}

fn touch(ctx: &ExecContext) -> i32 {
    if ctx.args.is_empty() {
        ctx.events
            .output(ctx.pid, "touch: missing file operand\n", true);
        return 1;
    }
    let mut code = 0;
    let mut fs = ctx.fs.lock().expect("filesystem poisoned");
    for arg in &ctx.args {
        let path = paths::join(&ctx.cwd, arg);
        if fs.is_dir(&path) {
            continue;
        }
        if fs.exists(&path) {
            continue;
        }
        if let Err(err) = fs.write_file(&path, "") {
            ctx.events.output(
                ctx.pid,
                format!("touch: cannot touch '{}': {}\n", arg, err),
                true,
            );
            code = 1;
        }
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::events::EventSink;
    use crate::fs::FileSystem;
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use vessel_protocol::{Pid, WorkerEvent};

    fn context(
        command: &str,
        args: &[&str],
    ) -> (
        ExecContext,
        mpsc::UnboundedReceiver<WorkerEvent>,
        mpsc::UnboundedSender<String>,
    ) {
        let (events, events_rx) = EventSink::channel();
        let (stdin_tx, stdin) = mpsc::unbounded_channel();
        let ctx = ExecContext {
            pid: Pid::new(1),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: "/".to_string(),
            env: HashMap::from([("HOME".to_string(), "/".to_string())]),
            fs: FileSystem::shared(),
            events,
            stdin,
            cancel: CancelToken::new(),
            http: None,
        };
        (ctx, events_rx, stdin_tx)
    }

    fn outputs(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<(String, bool)> {
        let mut collected = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::ProcessOutput {
                output, is_error, ..
            } = event
            {
                collected.push((output, is_error));
            }
        }
        collected
    }

    #[tokio::test]
    async fn echo_writes_one_line_and_exits_zero() {
        let (ctx, mut rx, _stdin) = context("echo", &["hi"]);
        let code = run(ctx).await;
        assert_eq!(code, 0);
        assert_eq!(outputs(&mut rx), vec![("hi\n".to_string(), false)]);
    }

    #[tokio::test]
    async fn ls_and_cat_read_the_virtual_fs() {
        let (mut ctx, mut rx, _stdin) = context("ls", &["/d"]);
        {
            let mut fs = ctx.fs.lock().unwrap();
            fs.create_directory("/d").unwrap();
            fs.write_file("/d/hello", "world").unwrap();
        }
        assert_eq!(execute(&mut ctx).await, 0);
        assert_eq!(outputs(&mut rx), vec![("hello\n".to_string(), false)]);

        ctx.command = "cat".to_string();
        ctx.args = vec!["/d/hello".to_string()];
        assert_eq!(execute(&mut ctx).await, 0);
        assert_eq!(outputs(&mut rx), vec![("world".to_string(), false)]);
    }

    #[tokio::test]
    async fn cat_missing_file_reports_on_stderr() {
        let (mut ctx, mut rx, _stdin) = context("cat", &["/nope"]);
        assert_eq!(execute(&mut ctx).await, 1);
        let output = outputs(&mut rx);
        assert_eq!(output.len(), 1);
        assert!(output[0].1);
        assert!(output[0].0.contains("/nope"));
    }

    #[tokio::test]
    async fn mkdir_touch_rm_roundtrip() {
        let (mut ctx, mut rx, _stdin) = context("mkdir", &["-p", "/a/b"]);
        assert_eq!(execute(&mut ctx).await, 0);

        ctx.command = "touch".to_string();
        ctx.args = vec!["/a/b/f".to_string()];
        assert_eq!(execute(&mut ctx).await, 0);
        assert!(ctx.fs.lock().unwrap().exists("/a/b/f"));

        ctx.command = "rm".to_string();
        ctx.args = vec!["-r".to_string(), "/a".to_string()];
        assert_eq!(execute(&mut ctx).await, 0);
        assert!(!ctx.fs.lock().unwrap().exists("/a"));
        assert!(outputs(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let (ctx, _rx, _stdin) = context("sleep", &["30"]);
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), EXIT_CODE_TERMINATED);
    }

    #[tokio::test]
    async fn cat_echoes_stdin_lines() {
        let (ctx, mut rx, stdin) = context("cat", &[]);
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(run(ctx));

        stdin.send("line one\n".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(outputs(&mut rx), vec![("line one\n".to_string(), false)]);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), EXIT_CODE_TERMINATED);
    }
}
