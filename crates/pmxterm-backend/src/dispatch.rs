//! Verb dispatch: a request line becomes a typed [`Command`] and then a
//! multiplexer call.

use std::sync::Arc;

use chrono::SecondsFormat;
use pmxterm_proto::{Command, Request, Response, Verb};
use pmxterm_pty::Multiplexer;
use serde_json::{json, Value};

use crate::context::BackendContext;
use crate::transport;

/// Answer one request. Never fails: problems become an error string next
/// to a `null` result.
pub async fn dispatch(ctx: &Arc<BackendContext>, request: Request) -> Response {
    let Ok(verb) = request.command.parse::<Verb>() else {
        log::debug!("unknown command {:?}", request.command);
        return Response::unknown_command(&request.command);
    };
    match Command::parse(verb, &request.args) {
        Ok(command) => execute(ctx, command).await,
        Err(e) => Response::error(e.to_string()),
    }
}

pub async fn execute(ctx: &Arc<BackendContext>, command: Command) -> Response {
    let command = match command {
        Command::SetupChannel { address } => {
            return Response::ok(transport::register_push_channel(ctx, address).await);
        }
        other => other,
    };

    // Multiplexer calls can block on PTY writes and reaping.
    let mux = Arc::clone(ctx.mux());
    let verb = command.verb();
    match tokio::task::spawn_blocking(move || run(&mux, command)).await {
        Ok(result) => Response::ok(result),
        Err(e) => {
            log::error!("{verb} failed: {e}");
            Response::error(format!("{verb} failed"))
        }
    }
}

fn run(mux: &Multiplexer, command: Command) -> Value {
    match command {
        Command::Keepalive {
            id,
            cols,
            rows,
            command,
        } => json!(mux.keepalive(&id, cols, rows, command.as_deref())),
        Command::Resize { id, cols, rows } => json!(mux.resize(&id, cols, rows)),
        Command::Write { id, data } => json!(mux.write(&id, data.as_bytes())),
        Command::Dump { id } => match mux.dump(&id) {
            Some(screen) => serde_json::to_value(screen).unwrap_or(Value::Null),
            None => Value::Null,
        },
        Command::Bury { id } => json!(mux.bury(&id)),
        Command::BuryAll => json!(mux.bury_all()),
        Command::IsAlive { id } => json!(mux.is_alive(&id)),
        Command::Pid { id } => json!(mux.pid(&id)),
        Command::LastChange { id } => json!(mux
            .last_change(&id)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))),
        Command::Platform => json!(mux.platform()),
        Command::Sessions => json!(mux.sessions()),
        // Needs the async transport; handled in `execute`.
        Command::SetupChannel { .. } => Value::Bool(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmxterm_pty::MultiplexerConfig;
    use std::time::Duration;

    fn context() -> Arc<BackendContext> {
        let mux = Multiplexer::new(MultiplexerConfig {
            default_command: Some("/bin/sh".to_string()),
            bury_grace: Duration::from_millis(500),
            ..Default::default()
        });
        Arc::new(BackendContext::new(Arc::new(mux)))
    }

    async fn send(ctx: &Arc<BackendContext>, command: &str, args: Value) -> Response {
        let request = Request {
            command: command.to_string(),
            args: serde_json::from_value(args).unwrap(),
        };
        dispatch(ctx, request).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_verb() {
        let ctx = context();
        let response = send(&ctx, "proc_explode", json!([])).await;
        assert_eq!(response.result, Value::Null);
        assert!(response.error.unwrap().contains("proc_explode"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bad_arguments() {
        let ctx = context();
        let response = send(&ctx, "keepalive", json!(["id", "wide", 24])).await;
        assert_eq!(response.result, Value::Null);
        assert!(response.error.is_some());

        let response = send(&ctx, "bury", json!([])).await;
        assert!(response.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_lifecycle_over_dispatch() {
        let ctx = context();

        let response = send(&ctx, "keepalive", json!(["s", 80, 24])).await;
        assert_eq!(response, Response::ok(true));
        assert_eq!(send(&ctx, "is_alive", json!(["s"])).await, Response::ok(true));
        assert!(send(&ctx, "pid", json!(["s"])).await.result.is_u64());
        assert_eq!(send(&ctx, "sessions", json!([])).await, Response::ok(json!(["s"])));

        let stamp = send(&ctx, "last_change", json!(["s"])).await.result;
        chrono::DateTime::parse_from_rfc3339(stamp.as_str().unwrap()).unwrap();

        let screen = send(&ctx, "dump", json!(["s"])).await.result;
        assert_eq!(screen["cols"], 80);
        assert_eq!(screen["rows"], 24);

        assert_eq!(send(&ctx, "resize", json!(["s", 100, 30])).await, Response::ok(true));
        assert_eq!(send(&ctx, "write", json!(["s", "true\n"])).await, Response::ok(true));
        assert_eq!(send(&ctx, "write", json!(["s", [116, 114, 117, 101, 10]])).await, Response::ok(true));

        assert_eq!(send(&ctx, "bury", json!(["s"])).await, Response::ok(true));
        assert_eq!(send(&ctx, "is_alive", json!(["s"])).await, Response::ok(false));
        assert_eq!(send(&ctx, "pid", json!(["s"])).await, Response::ok(Value::Null));
        assert_eq!(send(&ctx, "dump", json!(["s"])).await, Response::ok(Value::Null));
        assert_eq!(send(&ctx, "last_change", json!(["s"])).await, Response::ok(Value::Null));
        assert_eq!(send(&ctx, "keepalive", json!(["s", 80, 24])).await, Response::ok(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bury_all_and_platform() {
        let ctx = context();
        for id in ["a", "b"] {
            send(&ctx, "keepalive", json!([id, 80, 24])).await;
        }
        assert_eq!(send(&ctx, "bury_all", json!([])).await, Response::ok(true));
        assert_eq!(send(&ctx, "sessions", json!([])).await, Response::ok(json!([])));
        assert_eq!(
            send(&ctx, "platform", json!([])).await,
            Response::ok(std::env::consts::OS)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_setup_channel_rejects_bad_address() {
        let ctx = context();
        let response = send(&ctx, "setup_channel", json!(["carrier-pigeon://home"])).await;
        assert!(response.error.is_some());

        let response = send(&ctx, "setup_channel", json!(["ipc:///nonexistent/pmx.sock"])).await;
        assert_eq!(response, Response::ok(false));
    }
}
