//! Wires the long-running tasks together: one webhook adapter and one
//! logic worker per configured project, plus the shared HTTP intake.

use crate::{
    command::CommandParser,
    config::ProjectConfig,
    event_loop::{run_logic_event_loop, run_webhook_event_loop, WebhookEvent, QUEUE_CAPACITY},
    git::GitCli,
    github::GithubClient,
    interpreter::Interpreter,
    project::ProjectState,
    server::Server,
    Config, Result,
};
use futures::future::try_join_all;
use log::{error, info};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

pub async fn run_serve(config: Config, read_only: bool) -> Result<()> {
    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();
    let mut hook_queues = Vec::new();

    // Keep the snapshot receivers alive for the lifetime of the
    // process; read-only observers clone them
    let mut snapshots = Vec::new();

    for project in &config.projects {
        let (hook_tx, hook_rx) = mpsc::channel(QUEUE_CAPACITY);
        hook_queues.push(hook_tx);

        let snapshot_rx = start_project(&mut tasks, &config, project, hook_rx, read_only)?;
        snapshots.push(snapshot_rx);
    }

    let server = Server::new(config.secret.clone(), hook_queues);
    let addr = ([0, 0, 0, 0], config.port).into();
    tasks.push(tokio::spawn(server.serve(addr)));

    // A panicking task surfaces here as a join error and takes the
    // process down with it
    for result in try_join_all(tasks).await? {
        result?;
    }

    Ok(())
}

fn start_project(
    tasks: &mut Vec<JoinHandle<Result<()>>>,
    config: &Config,
    project: &ProjectConfig,
    hook_rx: mpsc::Receiver<WebhookEvent>,
    read_only: bool,
) -> Result<watch::Receiver<ProjectState>> {
    info!(
        "starting event loops for {}/{}",
        project.owner(),
        project.name()
    );

    let state = ProjectState::load(project.state_file())?;
    let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());

    let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
    tasks.push(tokio::spawn(run_webhook_event_loop(
        project.repo().clone(),
        hook_rx,
        events_tx,
    )));

    let git = GitCli::new(
        project.checkout().to_path_buf(),
        project.repo().to_github_ssh_url(),
        config.git.clone(),
    );
    let host = GithubClient::new(&config.github_api_token);
    let interpreter = Interpreter::new(project.clone(), git, host, read_only);
    let parser = CommandParser::new(&config.trigger.comment_prefix);

    let owner = project.owner().to_owned();
    let name = project.name().to_owned();
    let state_file = project.state_file().to_path_buf();
    tasks.push(tokio::spawn(async move {
        match run_logic_event_loop(parser, state_file, state, events_rx, interpreter, snapshot_tx)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                // The process must not outlive its worker
                error!("logic worker for {}/{} died: {:?}", owner, name, e);
                std::process::exit(1);
            }
        }
    }));

    Ok(snapshot_rx)
}
