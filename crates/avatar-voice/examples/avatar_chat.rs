//! Avatar Chat — talk to the avatar through your microphone and speakers.
//!
//! Listens with silence-based auto-stop, transcribes, streams the reply sentence by sentence
//! into speech and prints the mouth shapes the avatar would make.
//!
//! - With `AVATAR_API_KEY` (or `OPENAI_API_KEY`) set: OpenAI-compatible chat, TTS and STT.
//! - Without: placeholder backends (echo reply, tone per sentence), no network needed.
//! - `AVATAR_CONFIG=path/to/avatar.toml` loads settings from a file instead of the environment.
//!
//! Run with `RUST_LOG=avatar_voice=debug` to see per-sentence and per-clip traces.
//! Press Ctrl+C to stop.

use avatar_voice::{
    AvatarConfig, Backends, ConversationSession, CpalMicrophone, FaceTarget, MorphTargets,
    PlaybackEvent, RodioSink, VisemeWeightMap, VoiceActivityRecorder,
};
use std::collections::HashSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Face that logs the dominant mouth shape whenever it changes.
struct ConsoleFace {
    morphs: MorphTargets,
    last: Option<String>,
}

impl FaceTarget for ConsoleFace {
    fn shape_channels(&self) -> HashSet<String> {
        self.morphs.shape_channels()
    }

    fn apply(&mut self, weights: &VisemeWeightMap) {
        self.morphs.apply(weights);
        let dominant = weights
            .iter()
            .filter(|(name, w)| name.starts_with("viseme_") && *w > 0.2)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name.to_string());
        if dominant != self.last {
            if let Some(name) = &dominant {
                info!("👄 {} (jaw {:.2})", name, weights.get("jawOpen"));
            }
            self.last = dominant;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("AVATAR_CONFIG") {
        Ok(path) => AvatarConfig::load_from_path(Path::new(&path))?,
        Err(_) => {
            let config = AvatarConfig::from_env();
            config.validate()?;
            config
        }
    };

    info!("Avatar Chat — speak after the 🎙️, pause to send. Ctrl+C to stop.");
    match CpalMicrophone::list_input_devices() {
        Ok(devices) => info!("Input devices: {:?}", devices),
        Err(e) => info!("Could not list input devices: {}", e),
    }

    let backends = Backends::from_config(&config.backend)?;
    let sink = RodioSink::new(config.lipsync.fft_size)?;
    let face = ConsoleFace {
        morphs: MorphTargets::ready_player_me(),
        last: None,
    };
    let mut session = ConversationSession::new(&config, backends, sink, face);

    if let Some(mut events) = session.take_playback_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PlaybackEvent::ClipFailed { sequence_index, reason } => {
                        info!("Clip #{} failed: {}", sequence_index, reason)
                    }
                    PlaybackEvent::Drained => info!("🔇 Done speaking"),
                    _ => {}
                }
            }
        });
    }

    let (mut recorder, mut recorder_events) = VoiceActivityRecorder::new(CpalMicrophone::new());
    tokio::spawn(async move {
        while let Some(event) = recorder_events.recv().await {
            tracing::debug!("Recorder event: {:?}", event);
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
            }
            cancel.cancel();
        });
    }

    session.run_voice_loop(&mut recorder, config.vad.clone(), cancel).await?;

    for message in session.history() {
        info!("{:?}: {}", message.role, message.content);
    }
    Ok(())
}
