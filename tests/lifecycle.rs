//! End-to-end session runs against the in-memory sandbox.

use parking_lot::Mutex;
use playground::exercise::{Command, ExerciseConfig, ExerciseFile, TemplateKind};
use playground::lifecycle::{Session, SessionOptions};
use playground::sandbox::memory::{MemorySandbox, ScriptedProcess};
use playground::workspace::{Transition, WorkspaceState};
use playground::{BootState, ServerState};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn session(sandbox: &MemorySandbox) -> Session {
    session_with(sandbox, SessionOptions::default())
}

fn session_with(sandbox: &MemorySandbox, options: SessionOptions) -> Session {
    Session::new(Arc::new(sandbox.clone()), options)
}

fn node_exercise() -> ExerciseConfig {
    ExerciseConfig::new("hello", TemplateKind::Node)
        .with_file(ExerciseFile::inline("/index.js", "console.log('hi');\n"))
}

fn react_exercise() -> ExerciseConfig {
    ExerciseConfig::new("counter", TemplateKind::React)
        .with_file(ExerciseFile::inline("/src/App.jsx", "export default () => null;\n"))
        .with_solution(vec![ExerciseFile::inline(
            "/src/App.jsx",
            "export default () => 1;\n",
        )])
}

fn record_boot_states(session: &Session) -> (Arc<Mutex<Vec<BootState>>>, playground::events::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = session.store().on_transition(move |transition| {
        if let Transition::Boot { to, .. } = transition {
            sink.lock().push(to.clone());
        }
    });
    (seen, sub)
}

async fn wait_until<F>(session: &Session, predicate: F)
where
    F: Fn(&WorkspaceState) -> bool,
{
    let mut rx = session.store().subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|state| predicate(state)))
        .await
        .expect("condition not reached in time")
        .expect("store closed");
}

#[tokio::test]
async fn exercise_without_dependencies_skips_install() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000).stdout("listening\n"));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    let (states, _sub) = record_boot_states(&session);

    let end = session.start().await;

    assert_eq!(end, BootState::Ready);
    let states = states.lock().clone();
    assert_eq!(
        states,
        vec![BootState::Booting, BootState::Mounting, BootState::Ready]
    );
    assert!(!states.contains(&BootState::Installing));
    assert_eq!(sandbox.spawned(), vec!["npm run dev"]);
    assert_eq!(
        session.server_state(),
        ServerState::Ready {
            url: "http://localhost:3000".to_string(),
            port: 3000
        }
    );
}

#[tokio::test]
async fn failed_install_ends_in_error_and_never_starts_server() {
    let sandbox = MemorySandbox::new();
    sandbox.script(
        "npm install",
        ScriptedProcess::exit(1).stderr("npm ERR! \u{1b}[31mnetwork\u{1b}[0m unreachable\n"),
    );
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();

    let end = session.start().await;

    assert_eq!(end, BootState::Error("install failed with code 1".to_string()));
    assert_eq!(session.server_state(), ServerState::Idle);
    assert_eq!(sandbox.spawned(), vec!["npm install"]);

    let lines: Vec<String> = session
        .store()
        .terminal_lines()
        .into_iter()
        .map(|line| line.text)
        .collect();
    assert_eq!(lines, vec!["npm ERR! network unreachable"]);
}

#[tokio::test]
async fn start_while_installing_is_a_noop() {
    let sandbox = MemorySandbox::new();
    sandbox.script(
        "npm install",
        ScriptedProcess::exit(0)
            .stdout("added 3 packages\n")
            .with_chunk_delay(Duration::from_millis(200)),
    );
    sandbox.script("npm run dev", ScriptedProcess::serving(5173));
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };
    wait_until(&session, |state| state.boot == BootState::Installing).await;

    assert_eq!(session.start().await, BootState::Installing);
    assert_eq!(session.boot_state(), BootState::Installing);

    assert_eq!(running.await.unwrap(), BootState::Ready);
    let installs = sandbox
        .spawned()
        .iter()
        .filter(|command| *command == "npm install")
        .count();
    assert_eq!(installs, 1);
    assert_eq!(sandbox.boot_count(), 1);
}

#[tokio::test]
async fn start_from_error_runs_the_full_sequence_again() {
    let sandbox = MemorySandbox::new();
    sandbox.fail_next_boots(1);
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();

    let first = session.start().await;
    assert!(matches!(first, BootState::Error(ref cause) if cause.contains("simulated boot failure")));
    assert_eq!(session.server_state(), ServerState::Idle);

    let (states, _sub) = record_boot_states(&session);
    assert_eq!(session.start().await, BootState::Ready);
    assert_eq!(
        states.lock().clone(),
        vec![BootState::Booting, BootState::Mounting, BootState::Ready]
    );
    assert_eq!(sandbox.boot_count(), 2);
}

#[tokio::test]
async fn concurrent_starts_boot_once() {
    let sandbox = MemorySandbox::new().with_boot_delay(Duration::from_millis(50));
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();

    let (a, b) = tokio::join!(session.start(), session.start());
    assert!(a == BootState::Ready || b == BootState::Ready);
    assert_eq!(sandbox.boot_count(), 1);
    assert_eq!(sandbox.spawned(), vec!["npm run dev"]);
}

#[tokio::test]
async fn reset_kills_dev_server_once_and_clears_everything() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm install", ScriptedProcess::exit(0).stdout("up to date\n"));
    sandbox.script(
        "npm run dev",
        ScriptedProcess::serving(5173).stdout("  VITE v5.4.0  ready\n"),
    );
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();

    assert_eq!(session.start().await, BootState::Ready);
    assert!(matches!(session.server_state(), ServerState::Ready { port: 5173, .. }));

    session.reset();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.boot_state(), BootState::Idle);
    assert_eq!(session.server_state(), ServerState::Idle);
    assert!(session.store().terminal_lines().is_empty());
    assert_eq!(sandbox.kill_count("npm run dev"), 1);
    assert_eq!(sandbox.kill_count("npm install"), 0);
    assert!(session.manager().is_connected());
}

#[tokio::test]
async fn silent_dev_server_times_out() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::hanging());
    let session = session_with(
        &sandbox,
        SessionOptions {
            server_timeout: Duration::from_millis(100),
            ..SessionOptions::default()
        },
    );
    session.load_exercise(node_exercise()).unwrap();

    assert_eq!(session.start().await, BootState::Ready);
    assert_eq!(
        session.server_state(),
        ServerState::Error {
            cause: "startup timed out".to_string()
        }
    );
    assert_eq!(sandbox.kill_count("npm run dev"), 1);
}

#[tokio::test]
async fn dev_server_exiting_early_is_an_error() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::exit(2).stderr("SyntaxError\n"));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();

    session.start().await;
    assert_eq!(
        session.server_state(),
        ServerState::Error {
            cause: "dev server exited with code 2".to_string()
        }
    );
}

#[tokio::test]
async fn stop_kills_the_dev_server() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;

    session.stop();
    assert_eq!(session.server_state(), ServerState::Idle);
    assert_eq!(session.boot_state(), BootState::Ready);
    assert_eq!(sandbox.kill_count("npm run dev"), 1);

    assert!(matches!(session.start_server().await, ServerState::Ready { .. }));
}

#[tokio::test]
async fn edits_before_boot_are_mounted_and_edits_after_are_written() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();

    session.edit_file("/index.js", "v1").unwrap();
    assert!(session.store().editor().is_dirty("/index.js"));
    session.start().await;

    let files = sandbox.connection().unwrap().files();
    assert_eq!(files["/index.js"], "v1");
    assert!(files.contains_key("/package.json"));
    assert!(!session.store().editor().is_dirty("/index.js"));

    session.edit_file("/index.js", "v2").unwrap();
    session.flush_writes().await;
    assert_eq!(sandbox.connection().unwrap().files()["/index.js"], "v2");
    assert!(!session.store().editor().is_dirty("/index.js"));
}

#[tokio::test]
async fn read_only_files_cannot_be_edited() {
    let sandbox = MemorySandbox::new();
    let session = session(&sandbox);
    session
        .load_exercise(node_exercise().with_file(ExerciseFile::inline("/config.js", "x").read_only()))
        .unwrap();

    let err = session.edit_file("/config.js", "y").unwrap_err();
    assert_eq!(err, playground::PlaygroundError::ReadOnlyFile("/config.js".to_string()));
}

#[tokio::test]
async fn sandbox_side_changes_reach_the_files_map() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;

    let connection = sandbox.connection().unwrap();
    connection.external_write("/node_modules/pkg/index.js", "ignored");
    connection.external_write("/index.js", "formatted");

    wait_until(&session, |state| {
        state.files.get("/index.js").map(String::as_str) == Some("formatted")
    })
    .await;
    assert!(session.store().file("/node_modules/pkg/index.js").is_none());
    assert!(!session.store().editor().is_dirty("/index.js"));
}

#[tokio::test]
async fn own_writes_do_not_echo_back() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;

    session.edit_file("/index.js", "mine").unwrap();
    session.flush_writes().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.synchronizer().pending_credits("/index.js"), 0);
    assert_eq!(session.store().file("/index.js").as_deref(), Some("mine"));
}

#[tokio::test]
async fn toggling_the_solution_updates_the_sandbox() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(5173));
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();
    session.start().await;

    assert!(session.toggle_solution().unwrap());
    session.flush_writes().await;
    assert_eq!(
        sandbox.connection().unwrap().files()["/src/App.jsx"],
        "export default () => 1;\n"
    );

    assert!(session.toggle_solution().unwrap());
    session.flush_writes().await;
    assert_eq!(
        sandbox.connection().unwrap().files()["/src/App.jsx"],
        "export default () => null;\n"
    );
}

#[tokio::test]
async fn loading_another_exercise_reuses_the_connection() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;

    let next = ExerciseConfig::new("second", TemplateKind::Node)
        .with_file(ExerciseFile::inline("/index.js", "console.log(2);\n"));
    session.load_exercise(next).unwrap();
    assert_eq!(session.boot_state(), BootState::Idle);
    assert_eq!(sandbox.kill_count("npm run dev"), 1);

    assert_eq!(session.start().await, BootState::Ready);
    assert_eq!(sandbox.boot_count(), 1);
    assert_eq!(
        sandbox.connection().unwrap().files()["/index.js"],
        "console.log(2);\n"
    );
}

#[tokio::test]
async fn dispose_drops_the_connection() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;

    session.dispose();
    assert!(!session.manager().is_connected());
    assert_eq!(session.boot_state(), BootState::Idle);
    assert_eq!(sandbox.kill_count("npm run dev"), 1);
}

#[tokio::test]
async fn later_exercise_registers_its_preview_port() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(5173));
    let session = session(&sandbox);
    session.load_exercise(node_exercise()).unwrap();
    session.start().await;
    assert!(sandbox.connection().unwrap().watched_ports().is_empty());

    session.load_exercise(react_exercise()).unwrap();
    assert_eq!(session.start().await, BootState::Ready);

    assert_eq!(sandbox.boot_count(), 1);
    assert_eq!(sandbox.connection().unwrap().watched_ports(), vec![5173]);
    assert!(matches!(session.server_state(), ServerState::Ready { port: 5173, .. }));
}

#[cfg(unix)]
#[tokio::test]
async fn local_sandbox_probes_port_of_second_exercise() {
    use playground::sandbox::local::LocalSandbox;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tmp = tempfile::TempDir::new().unwrap();
    let session = Session::new(
        Arc::new(LocalSandbox::new(tmp.path())),
        SessionOptions {
            server_timeout: Duration::from_secs(3),
            ..SessionOptions::default()
        },
    );

    let mut first = node_exercise();
    first.dev_command = Command::new("true", Vec::<String>::new());
    session.load_exercise(first).unwrap();
    assert_eq!(session.start().await, BootState::Ready);
    assert_eq!(
        session.server_state(),
        ServerState::Error {
            cause: "dev server exited with code 0".to_string()
        }
    );

    let mut second = ExerciseConfig::new("second", TemplateKind::Node)
        .with_file(ExerciseFile::inline("/index.js", "// serve\n"));
    second.dev_command = Command::new("sleep", ["5"]);
    second.preview_port = Some(port);
    session.load_exercise(second).unwrap();
    assert_eq!(session.start().await, BootState::Ready);

    assert_eq!(session.manager().boot_count(), 1);
    assert_eq!(
        session.server_state(),
        ServerState::Ready {
            url: format!("http://localhost:{port}"),
            port
        }
    );
    session.dispose();
}

#[tokio::test]
async fn declared_dependencies_reach_an_authored_manifest() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    let exercise = node_exercise()
        .with_dependency("lodash", "^4")
        .with_file(ExerciseFile::inline("/package.json", r#"{"name":"author"}"#));
    session.load_exercise(exercise).unwrap();

    assert_eq!(session.start().await, BootState::Ready);
    assert_eq!(sandbox.spawned(), vec!["npm install", "npm run dev"]);

    let mounted = sandbox.connection().unwrap().files()["/package.json"].clone();
    let manifest: serde_json::Value = serde_json::from_str(&mounted).unwrap();
    assert_eq!(manifest["name"], "author");
    assert_eq!(manifest["dependencies"]["lodash"], "^4");
    assert_eq!(session.store().file("/package.json"), Some(mounted));
    assert!(!session.store().editor().is_dirty("/package.json"));
}

#[tokio::test]
async fn template_manifest_is_mounted_before_install() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(5173));
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();
    session.start().await;

    let mounted = sandbox.connection().unwrap().files()["/package.json"].clone();
    let manifest: serde_json::Value = serde_json::from_str(&mounted).unwrap();
    assert_eq!(manifest["dependencies"]["react"], "^18.3.1");
    assert_eq!(manifest["devDependencies"]["vite"], "^5.4.0");
}

#[tokio::test]
async fn changes_after_a_lagged_watch_still_propagate() {
    let sandbox = MemorySandbox::new();
    sandbox.script("npm run dev", ScriptedProcess::serving(3000));
    let session = session(&sandbox);
    let mut exercise = node_exercise();
    for i in 0..1100 {
        exercise = exercise.with_file(ExerciseFile::inline(format!("/f{i:04}.js"), i.to_string()));
    }
    session.load_exercise(exercise).unwrap();
    assert_eq!(session.start().await, BootState::Ready);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(session.synchronizer().pending_credits("/f0000.js"), 0);
    sandbox
        .connection()
        .unwrap()
        .external_write("/f0000.js", "rewritten by a tool");
    wait_until(&session, |state| {
        state.files.get("/f0000.js").map(String::as_str) == Some("rewritten by a tool")
    })
    .await;
}

#[tokio::test]
async fn edits_made_during_install_are_written_once_ready() {
    let sandbox = MemorySandbox::new();
    sandbox.script(
        "npm install",
        ScriptedProcess::exit(0)
            .stdout("added 3 packages\n")
            .with_chunk_delay(Duration::from_millis(200)),
    );
    sandbox.script("npm run dev", ScriptedProcess::serving(5173));
    let session = session(&sandbox);
    session.load_exercise(react_exercise()).unwrap();

    let running = {
        let session = session.clone();
        tokio::spawn(async move { session.start().await })
    };
    wait_until(&session, |state| state.boot == BootState::Installing).await;
    session
        .edit_file("/src/App.jsx", "export default () => 2;\n")
        .unwrap();
    assert!(session.store().editor().is_dirty("/src/App.jsx"));

    assert_eq!(running.await.unwrap(), BootState::Ready);
    session.flush_writes().await;
    assert_eq!(
        sandbox.connection().unwrap().files()["/src/App.jsx"],
        "export default () => 2;\n"
    );
    assert!(!session.store().editor().is_dirty("/src/App.jsx"));
}
