use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vitalwatch::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    // 2. Create a demo configuration with a short countdown.
    let config = VitalWatchConfig {
        countdown: CountdownConfig {
            default_secs: 12,
            min_secs: 5,
            max_secs: 300,
        },
        retry: RetryConfig::default(),
    };

    // 3. Create the EscalationEngine with a log-only notification transport.
    let engine = EscalationEngine::new(config, Arc::new(LogDispatcher));

    // 4. Spawn concurrent tasks to listen to the event streams.
    spawn_event_listeners(&engine);

    // 5. Register contacts and trigger demo episodes.
    register_demo_episodes(&engine).await?;

    // 6. Run the engine.
    engine.run().await?;

    Ok(())
}

/// Spawns a task per event stream so the demo narrates everything the engine does.
fn spawn_event_listeners(engine: &EscalationEngine) {
    let mut episode_rx = engine.subscribe_episode_events();
    tokio::spawn(async move {
        while let Ok(event) = episode_rx.recv().await {
            let episode = event.episode();
            info!(
                "[EPISODE] {} => {} ({} remaining)",
                episode.user_id,
                paint_state(episode.state),
                episode.format_remaining()
            );
        }
    });

    let mut alert_rx = engine.subscribe_alert_events();
    tokio::spawn(async move {
        while let Ok(event) = alert_rx.recv().await {
            info!("[ALERT] => {:?}", event);
        }
    });
}

fn paint_state(state: EpisodeState) -> colored::ColoredString {
    let label = state.to_string();
    match state {
        EpisodeState::Armed => label.yellow(),
        EpisodeState::Cancelled => label.green(),
        EpisodeState::Notifying => label.cyan(),
        EpisodeState::Escalated => label.red().bold(),
        EpisodeState::Resolved => label.blue(),
    }
}

/// Registers demo contacts and walks two episodes through the state machine.
async fn register_demo_episodes(engine: &EscalationEngine) -> Result<()> {
    // --- Ada: panic button, countdown runs out, contacts get notified ---
    let ada = UserId("ada".to_string());
    engine
        .set_contacts(
            ada.clone(),
            vec![
                EmergencyContact {
                    phone: Some("+1-555-0101".to_string()),
                    relationship: Some("partner".to_string()),
                    ..EmergencyContact::new(ContactId(1), "Dana")
                },
                EmergencyContact {
                    priority: 2,
                    ..EmergencyContact::new(ContactId(2), "Lee")
                },
            ],
        )
        .await;
    engine
        .start_episode(ada, TriggerKind::PanicButton, EpisodeOptions::default())
        .await?;

    // --- Bea: manual trigger, cancelled before the countdown expires ---
    let bea = UserId("bea".to_string());
    engine
        .set_contacts(
            bea.clone(),
            vec![EmergencyContact::new(ContactId(3), "Max")],
        )
        .await;
    let episode = engine
        .start_episode(
            bea,
            TriggerKind::Manual,
            EpisodeOptions {
                countdown_secs: Some(30),
                message: Some("walking home, check on me".to_string()),
                ..Default::default()
            },
        )
        .await?;

    let cancel_engine = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        match cancel_engine.cancel(episode.id).await {
            Ok(_) => info!("[DEMO] Bea tapped 'I'm OK'; her episode is cancelled."),
            Err(err) => info!("[DEMO] cancel failed: {err}"),
        }
    });

    Ok(())
}
