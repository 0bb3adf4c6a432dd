//! Learner responders: who speaks for the learner at learner-owned nodes.

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::debug;

use agir_core::error::{AgirError, Result};
use agir_core::traits::{LearnerResponder, LearnerTurn};
use agir_core::types::GenerationRequest;

/// Impersonates the learner with the resolved provider.
#[derive(Debug, Default, Clone)]
pub struct SimulatedLearner;

impl SimulatedLearner {
    pub fn new() -> Self {
        Self
    }

    fn persona(turn: &LearnerTurn<'_>) -> String {
        let role = turn
            .process
            .learner()
            .attribute("role")
            .unwrap_or("learner");
        format!(
            "You are {}, a {}. You are currently in the '{}' phase of a process. \
             Respond as if you are this person.",
            turn.learner.display_name(),
            role,
            turn.node.name
        )
    }
}

impl LearnerResponder for SimulatedLearner {
    fn respond<'a>(&'a self, turn: LearnerTurn<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let prompt = format!(
                "{}\n\nPlease provide your response as {}.",
                turn.context.user_prompt,
                turn.learner.display_name()
            );
            let request = GenerationRequest::new(prompt, turn.params).with_system(Self::persona(&turn));
            debug!(node = %turn.node.name, learner = %turn.learner.username, "Simulating learner");
            turn.provider.generate(request).await
        })
    }
}

/// Reads the learner's answers from a line-oriented source (stdin in the CLI).
pub struct InteractiveLearner<R, W> {
    io: Mutex<(R, W)>,
}

impl InteractiveLearner<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> InteractiveLearner<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
        }
    }
}

impl<R, W> LearnerResponder for InteractiveLearner<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn respond<'a>(&'a self, turn: LearnerTurn<'a>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let mut guard = self.io.lock().await;
            let (reader, writer) = &mut *guard;

            let header = format!(
                "\n=== {} ===\n{}\n",
                turn.node.name, turn.context.user_prompt
            );
            writer.write_all(header.as_bytes()).await?;

            loop {
                let prompt = format!("{}> ", turn.learner.username);
                writer.write_all(prompt.as_bytes()).await?;
                writer.flush().await?;

                let mut line = String::new();
                if reader.read_line(&mut line).await? == 0 {
                    return Err(AgirError::execution(
                        &turn.node.name,
                        "learner input closed",
                    ));
                }
                let answer = line.trim();
                if !answer.is_empty() {
                    return Ok(answer.to_string());
                }
            }
        })
    }
}
