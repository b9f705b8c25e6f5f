//! End-to-end orchestrator flows: recording surface, mock chat backend,
//! fake image backend and scripted speech input.

use crate::helpers::{
    Harness, RecordingSurface, RecordingSynth, SurfaceEvent, harness, harness_with_synth,
    ndjson_body, tick_until, wait_until,
};
use cithia::audio::capture::{FrameSource, OpenedSource};
use cithia::pipeline::messages::TaskKind;
use cithia::pipeline::orchestrator::{IMAGE_STARTED_REPLY, IMAGE_TIPS_QUESTION, PROMPT_ADVICE};
use cithia::stt::{DecodeEvent, SpeechDecoder};
use cithia::{AssistantConfig, AssistantError, Orchestrator, Role, Submission, UserAction};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn start_server(runtime: &tokio::runtime::Runtime) -> MockServer {
    runtime.block_on(MockServer::start())
}

fn mount_reply(runtime: &tokio::runtime::Runtime, server: &MockServer, prompt: &str, fragments: &[&str]) {
    runtime.block_on(
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "prompt": prompt })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson_body(fragments), "application/x-ndjson"),
            )
            .mount(server),
    );
}

fn chat_config(server: &MockServer) -> AssistantConfig {
    let mut config = AssistantConfig::default();
    config.llm.api_url = server.uri();
    config
}

fn chat_idle(orchestrator: &Orchestrator<RecordingSurface>) -> bool {
    !orchestrator.is_running(TaskKind::ChatStreaming)
}

#[test]
fn hello_streams_hi_there_into_memory_and_speech() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    mount_reply(&runtime, &server, "\nUser: Hello\nBot:", &["Hi", " there"]);
    let Harness {
        mut orchestrator,
        synth,
        output,
        runtime: _runtime,
        ..
    } = harness(runtime, chat_config(&server));

    assert_eq!(orchestrator.submit_text("Hello"), Submission::ChatStarted);
    assert_eq!(
        orchestrator.surface().events[..2],
        [
            SurfaceEvent::Append(Role::User, "Hello".into()),
            SurfaceEvent::Append(Role::Bot, String::new()),
        ]
    );

    tick_until(&mut orchestrator, chat_idle);

    assert_eq!(orchestrator.surface().last_message_text(), Some("Hi there"));
    let turns = orchestrator.memory().turns();
    assert_eq!(turns.len(), 2);
    assert_eq!((turns[0].role(), turns[0].text()), (Role::User, "Hello"));
    assert_eq!((turns[1].role(), turns[1].text()), (Role::Bot, "Hi there"));
    assert!(wait_until(Duration::from_secs(2), || synth.spoken() == vec!["Hi there"]));
    assert!(wait_until(Duration::from_secs(2), || output.log() == vec!["start speech-0.wav"]));
}

#[test]
fn follow_up_sends_history_once() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    mount_reply(&runtime, &server, "\nUser: Hello\nBot:", &["Hi there"]);
    mount_reply(
        &runtime,
        &server,
        "User: Hello\nBot: Hi there\nUser: And you?\nBot:",
        &["Fine."],
    );
    let Harness {
        mut orchestrator,
        runtime,
        ..
    } = harness(runtime, chat_config(&server));

    orchestrator.submit_text("Hello");
    tick_until(&mut orchestrator, chat_idle);
    orchestrator.submit_text("And you?");
    tick_until(&mut orchestrator, chat_idle);

    assert_eq!(orchestrator.memory().last().unwrap().text(), "Fine.");
    let requests = runtime.block_on(server.received_requests()).unwrap();
    assert_eq!(requests.len(), 2);
}

#[test]
fn second_message_is_rejected_while_streaming() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    runtime.block_on(
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson_body(&["slow answer"]), "application/x-ndjson")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server),
    );
    let Harness {
        mut orchestrator,
        runtime,
        ..
    } = harness(runtime, chat_config(&server));

    assert_eq!(orchestrator.submit_text("one"), Submission::ChatStarted);
    orchestrator.tick();
    assert_eq!(
        orchestrator.submit_text("two"),
        Submission::Rejected(TaskKind::ChatStreaming)
    );
    tick_until(&mut orchestrator, chat_idle);

    let texts: Vec<&str> = orchestrator
        .memory()
        .turns()
        .iter()
        .map(|t| t.text())
        .collect();
    assert_eq!(texts, vec!["one", "slow answer"]);
    let requests = runtime.block_on(server.received_requests()).unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(orchestrator.surface().appended(Role::System).len(), 1);
}

#[test]
fn backend_error_shows_one_message_and_stays_silent() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    runtime.block_on(
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server),
    );
    let Harness {
        mut orchestrator,
        synth,
        runtime: _runtime,
        ..
    } = harness(runtime, chat_config(&server));

    orchestrator.submit_text("Hello");
    tick_until(&mut orchestrator, chat_idle);
    for _ in 0..3 {
        orchestrator.tick();
    }

    let errors: Vec<_> = orchestrator
        .surface()
        .events
        .iter()
        .filter(|e| matches!(e, SurfaceEvent::Replace(t) if t.contains("500")))
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(orchestrator.memory().len(), 1);
    std::thread::sleep(Duration::from_millis(50));
    assert!(synth.spoken().is_empty());
}

#[cfg(unix)]
#[test]
fn red_balloon_image_is_generated_and_shown() {
    use crate::helpers::{WRITING_BACKEND, fake_image_backend};

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let backend_dir = tempfile::tempdir().unwrap();
    let backend = fake_image_backend(backend_dir.path(), WRITING_BACKEND);
    let mut config = AssistantConfig::default();
    config.image.executable = backend.to_string_lossy().into_owned();
    config.image.output_dir = Some(backend_dir.path().to_path_buf());
    let Harness {
        mut orchestrator,
        synth,
        dir,
        runtime: _runtime,
        ..
    } = harness(runtime, config);

    assert_eq!(
        orchestrator.submit_text("generate image: a red balloon"),
        Submission::ImageStarted
    );
    assert!(
        orchestrator
            .surface()
            .events
            .contains(&SurfaceEvent::Controls(false))
    );
    tick_until(&mut orchestrator, |o| {
        !o.is_running(TaskKind::ImageGeneration)
    });
    for _ in 0..3 {
        orchestrator.tick();
    }

    let prompt = std::fs::read_to_string(backend_dir.path().join("prompt.txt")).unwrap();
    assert_eq!(prompt, "a red balloon");

    let surface = orchestrator.surface();
    let image = orchestrator.last_image().unwrap().to_path_buf();
    assert!(image.is_file());
    assert_eq!(surface.count(&SurfaceEvent::Image(image.clone())), 1);
    assert_eq!(surface.count(&SurfaceEvent::Controls(true)), 1);
    assert!(
        surface
            .appended(Role::Bot)
            .contains(&"Image generated successfully!")
    );

    let memory: Vec<&str> = orchestrator
        .memory()
        .turns()
        .iter()
        .map(|t| t.text())
        .collect();
    assert_eq!(
        memory,
        vec!["generate image: a red balloon", IMAGE_TIPS_QUESTION]
    );
    assert!(wait_until(Duration::from_secs(2), || {
        synth.spoken().iter().any(|s| s == IMAGE_STARTED_REPLY)
    }));

    let saved = dir.path().join("saved.png");
    orchestrator.handle(UserAction::RequestSaveLastImage {
        destination: saved.clone(),
    });
    assert_eq!(std::fs::read(&saved).unwrap(), b"PNG");
}

struct OneFrame;

impl FrameSource for OneFrame {
    fn open(&self) -> cithia::Result<OpenedSource> {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(vec![0i16; 160]).unwrap();
        Ok(OpenedSource::new(rx, tx))
    }
}

struct FixedDecoder(Option<String>);

impl SpeechDecoder for FixedDecoder {
    fn accept_frame(&mut self, _frame: &[i16]) -> cithia::Result<DecodeEvent> {
        match self.0 {
            Some(ref text) => Ok(DecodeEvent::Utterance(text.clone())),
            None => Err(AssistantError::Stt("decoder unavailable".into())),
        }
    }
}

#[test]
fn voice_input_is_submitted_as_chat() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    mount_reply(&runtime, &server, "\nUser: what is rust\nBot:", &["A language."]);
    let Harness {
        orchestrator,
        runtime: _runtime,
        ..
    } = harness(runtime, chat_config(&server));
    let mut orchestrator =
        orchestrator.with_speech_capture(OneFrame, FixedDecoder(Some("what is rust".into())));

    assert!(orchestrator.request_voice_input());
    assert!(!orchestrator.request_voice_input());
    tick_until(&mut orchestrator, |o| {
        !o.is_running(TaskKind::SpeechCapture) && o.memory().len() == 2
    });

    let memory: Vec<&str> = orchestrator
        .memory()
        .turns()
        .iter()
        .map(|t| t.text())
        .collect();
    assert_eq!(memory, vec!["what is rust", "A language."]);
    // The worker is handed back for the next request.
    assert!(orchestrator.request_voice_input());
}

#[test]
fn failed_recognition_takes_no_action() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let Harness {
        orchestrator,
        runtime: _runtime,
        ..
    } = harness(runtime, AssistantConfig::default());
    let mut orchestrator = orchestrator.with_speech_capture(OneFrame, FixedDecoder(None));

    assert!(orchestrator.request_voice_input());
    tick_until(&mut orchestrator, |o| !o.is_running(TaskKind::SpeechCapture));

    assert!(orchestrator.memory().is_empty());
    assert!(!orchestrator.is_running(TaskKind::ChatStreaming));
}

#[test]
fn run_loop_processes_actions_until_sender_drops() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let Harness {
        mut orchestrator,
        runtime: _runtime,
        ..
    } = harness(runtime, AssistantConfig::default());

    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(UserAction::SubmitText("please refine prompt".into()))
        .unwrap();
    tx.send(UserAction::SetSpeechOutput(false)).unwrap();
    drop(tx);

    orchestrator.run(&rx, Duration::from_millis(5));

    assert_eq!(orchestrator.memory().len(), 2);
    assert!(!orchestrator.speech_output_enabled());
    assert!(orchestrator.cancel_token().is_cancelled());
}

/// Reply queued for speech, then `interrupt` runs while synthesis is still busy.
fn queued_speech_is_dropped_after(interrupt: impl FnOnce(&mut Orchestrator<RecordingSurface>)) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let Harness {
        mut orchestrator,
        synth,
        output,
        runtime: _runtime,
        ..
    } = harness_with_synth(
        runtime,
        AssistantConfig::default(),
        RecordingSynth::slow(Duration::from_millis(200)),
    );

    assert_eq!(orchestrator.submit_text("please refine prompt"), Submission::Answered);
    interrupt(&mut orchestrator);

    assert!(wait_until(Duration::from_secs(2), || {
        synth.spoken() == vec![PROMPT_ADVICE]
    }));
    assert!(wait_until(Duration::from_secs(2), || !synth.file(0).exists()));
    std::thread::sleep(Duration::from_millis(50));
    assert!(output.log().is_empty(), "played: {:?}", output.log());
    assert!(!orchestrator.speaker().playback().is_playing());
}

#[test]
fn disabling_speech_drops_reply_still_synthesizing() {
    queued_speech_is_dropped_after(|o| o.set_speech_output(false));
}

#[test]
fn stop_drops_reply_still_synthesizing() {
    queued_speech_is_dropped_after(|o| o.stop_playback());
}

#[test]
fn speech_after_stop_plays_again() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let Harness {
        mut orchestrator,
        output,
        runtime: _runtime,
        ..
    } = harness(runtime, AssistantConfig::default());

    orchestrator.stop_playback();
    orchestrator.submit_text("please refine prompt");

    assert!(wait_until(Duration::from_secs(2), || {
        output.log() == vec!["start speech-0.wav"]
    }));
}
