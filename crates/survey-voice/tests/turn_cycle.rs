//! Turn-taking order, languages, silence handling and manual listening.

mod common;

use common::{activity_trace, collect_until, idle, test_config, wait_for, Harness};
use std::sync::atomic::Ordering;
use std::time::Duration;
use survey_voice::{
    Activity, CallConfig, CallError, CallStatus, ConversationTurn, EncodedAudio, NoticeKind, Role,
};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn call_opens_with_system_turn_then_agent_greeting() {
    let h = Harness::new(test_config());
    h.generator.push(Ok("Hello! Do you have a minute?".to_string()));
    let mut rx = h.orch.subscribe();
    let dialed_at = Instant::now();

    assert_ok!(h.orch.start_call("s1").await);

    let dialing = rx.recv().await.unwrap();
    assert_eq!(dialing.status, CallStatus::Dialing);
    assert_eq!(dialing.survey_id.as_deref(), Some("s1"));
    assert_eq!(
        dialing.history,
        vec![ConversationTurn::new(
            Role::System,
            "Ask about satisfaction\n\nPlease conduct the entire survey in English."
        )]
    );

    wait_for(&mut rx, |s| s.status == CallStatus::Connected).await;
    assert!(dialed_at.elapsed() >= Duration::from_millis(2000));

    let greeted = wait_for(&mut rx, |s| s.history.len() == 2).await;
    assert_eq!(
        greeted.history[1],
        ConversationTurn::new(Role::Agent, "Hello! Do you have a minute?")
    );

    // The opening prompt goes to the generator but never into the log.
    let request = h.generator.request(0);
    assert_eq!(request.len(), 2);
    assert_eq!(
        request[1],
        ConversationTurn::new(Role::User, "Say hello and start the survey naturally.")
    );
    assert!(greeted.history.iter().all(|t| t.role != Role::User));

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn successful_turn_visits_each_activity_once() {
    let h = Harness::new(test_config());
    h.recorder.push_speech();
    h.transcriber.push(Ok("Very satisfied".to_string()));
    h.generator.push(Ok("How satisfied are you with our service?".to_string()));
    h.generator.push(Ok("Great, thank you!".to_string()));
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    let snaps = collect_until(&mut rx, |s| {
        s.history.len() == 4 && s.activity == Activity::Capturing
    })
    .await;

    assert_eq!(
        activity_trace(&snaps),
        vec![
            Activity::None,
            Activity::Generating,
            Activity::Synthesizing,
            Activity::Playing,
            Activity::None,
            Activity::Capturing,
            Activity::Transcribing,
            Activity::Generating,
            Activity::Synthesizing,
            Activity::Playing,
            Activity::None,
            Activity::Capturing,
        ]
    );

    let last = snaps.last().unwrap();
    assert_eq!(last.history[2], ConversationTurn::new(Role::User, "Very satisfied"));
    assert_eq!(last.history[3], ConversationTurn::new(Role::Agent, "Great, thank you!"));
    assert_eq!(h.generator.request(1), last.history[..3].to_vec());
    assert_eq!(*h.transcriber.languages.lock().unwrap(), vec!["en".to_string()]);
    assert_eq!(h.sink.played.load(Ordering::SeqCst), 2);
    assert_eq!(h.local.spoken.load(Ordering::SeqCst), 0);

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn spanish_survey_uses_spanish_conventions() {
    let h = Harness::new(test_config());
    h.synth.fail_always(1);
    let mut rx = h.orch.subscribe();

    h.orch.start_call("es1").await.unwrap();
    let snap = wait_for(&mut rx, |s| s.history.len() == 2 && s.activity == Activity::None).await;

    assert!(snap.history[0]
        .content
        .ends_with("\n\nPlease conduct the entire survey in Spanish."));
    assert_eq!(
        h.generator.request(0)[1].content,
        "Saluda y comienza la encuesta de forma natural."
    );
    assert_eq!(*h.synth.voices.lock().unwrap(), vec!["echo".to_string()]);
    assert_eq!(*h.local.locales.lock().unwrap(), vec!["es-ES".to_string()]);

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn empty_window_skips_transcription_and_reopens() {
    let h = Harness::new(test_config());
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    let silent = wait_for(&mut rx, |s| s.silence_retries == 1).await;
    assert_eq!(silent.status, CallStatus::Connected);
    assert_eq!(silent.activity, Activity::None);
    assert_eq!(silent.transcript_so_far, "Silence detected. Try again.");
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);

    let paused_at = Instant::now();
    let reopened = wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;
    assert!(paused_at.elapsed() >= Duration::from_millis(1500));
    assert_eq!(reopened.silence_retries, 1);
    assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 2);

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn empty_window_is_reported_once() {
    let h = Harness::new(test_config());
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;
    let closed = rx.recv().await.unwrap();

    assert_eq!(closed.activity, Activity::None);
    assert_eq!(closed.silence_retries, 1);
    assert_eq!(closed.transcript_so_far, "Silence detected. Try again.");

    let next = rx.recv().await.unwrap();
    assert_eq!(next.activity, Activity::Capturing);
    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn blank_transcription_counts_as_silence() {
    let h = Harness::new(test_config());
    h.recorder.push_speech();
    h.transcriber.push(Ok("   ".to_string()));
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    let silent = wait_for(&mut rx, |s| s.silence_retries == 1).await;

    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 1);
    assert_eq!(silent.history.len(), 2);
    assert_eq!(h.generator.calls(), 1);

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn silence_below_ceiling_keeps_the_call_alive() {
    let h = Harness::new(CallConfig {
        max_silence_retries: 2,
        ..test_config()
    });
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.silence_retries == 2).await;
    let reopened = wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;

    assert_eq!(reopened.status, CallStatus::Connected);
    assert!(reopened.notice.is_none());
    assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 3);

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn silence_past_ceiling_ends_the_call() {
    let h = Harness::new(CallConfig {
        max_silence_retries: 2,
        ..test_config()
    });
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    let ended = wait_for(&mut rx, |s| s.status == CallStatus::Terminated).await;

    let notice = ended.notice.expect("no-response notice");
    assert_eq!(notice.kind, NoticeKind::NoResponse);
    assert_eq!(notice.message, "No response from the respondent. Ending the call.");
    assert_eq!(ended.activity, Activity::None);
    assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 3);
    assert_eq!(h.transcriber.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn speech_resets_the_silence_counter() {
    let h = Harness::new(test_config());
    h.recorder.push(Ok(EncodedAudio::empty()));
    h.recorder.push_speech();
    h.transcriber.push(Ok("Yes".to_string()));
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.silence_retries == 1).await;
    let answered = wait_for(&mut rx, |s| s.history.len() == 3).await;

    assert_eq!(answered.silence_retries, 0);
    assert_eq!(answered.transcript_so_far, "Yes");

    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn listening_window_stops_at_its_ceiling() {
    let h = Harness::new(test_config());
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;
    let opened_at = Instant::now();
    wait_for(&mut rx, |s| s.activity != Activity::Capturing).await;

    assert!(opened_at.elapsed() >= Duration::from_millis(6000));
    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn manual_stop_closes_the_window_early() {
    let h = Harness::new(test_config());
    h.recorder.push_speech();
    h.transcriber.push(Ok("Fine".to_string()));
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;
    let opened_at = Instant::now();

    assert_ok!(h.orch.manual_stop_listening().await);
    wait_for(&mut rx, |s| s.activity == Activity::Transcribing).await;

    assert!(opened_at.elapsed() < Duration::from_millis(6000));
    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn manual_start_cuts_the_silence_pause_short() {
    let h = Harness::new(test_config());
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.silence_retries == 1).await;
    let paused_at = Instant::now();

    assert_ok!(h.orch.manual_start_listening().await);
    wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;

    assert!(paused_at.elapsed() < Duration::from_millis(1500));
    h.orch.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn without_auto_listen_the_operator_opens_each_window() {
    let h = Harness::new(CallConfig {
        auto_listen: false,
        ..test_config()
    });
    h.recorder.push_speech();
    h.transcriber.push(Ok("Quite happy".to_string()));
    let mut rx = h.orch.subscribe();

    h.orch.start_call("s1").await.unwrap();
    wait_for(&mut rx, |s| s.history.len() == 2 && s.activity == Activity::None).await;

    idle(Duration::from_secs(30)).await;
    assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 0);
    assert!(matches!(
        h.orch.manual_stop_listening().await,
        Err(CallError::InvalidState { activity: Activity::None, .. })
    ));

    assert_ok!(h.orch.manual_start_listening().await);
    wait_for(&mut rx, |s| s.activity == Activity::Capturing).await;
    assert_err!(h.orch.manual_start_listening().await);

    assert_ok!(h.orch.manual_stop_listening().await);
    let done = wait_for(&mut rx, |s| s.history.len() == 4 && s.activity == Activity::None).await;
    assert_eq!(done.history[2], ConversationTurn::new(Role::User, "Quite happy"));

    idle(Duration::from_secs(30)).await;
    assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 1);
    h.orch.end_call().await;
}
