use anyhow::Context;
use nuimo_controller_rust::domain::models::{Characteristic, ConnectionState, ControllerEvent};
use nuimo_controller_rust::domain::settings::SettingsService;
use nuimo_controller_rust::infrastructure::logging;
use nuimo_controller_rust::infrastructure::transport::SimulatedTransport;
use nuimo_controller_rust::session::{ChannelListener, ControllerSession};
use nuimo_controller_rust::{DiscoveryManager, DisplayOptions, LedMatrix};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::info;

const SIMULATED_ADDRESS: &str = "C4:D7:54:71:1E:01";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?.get().clone();
    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!("Starting Nuimo controller demo against a simulated device");

    let mut discovery = DiscoveryManager::new(&settings.discovery);
    discovery.start_discovery();
    discovery.device_found(SIMULATED_ADDRESS, Some("Nuimo"), Instant::now());
    let address = discovery
        .discovered_controllers()
        .into_iter()
        .next()
        .context("No controller discovered")?;
    discovery.stop_discovery();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = SimulatedTransport::with_auto_respond(events_tx);
    let remote = transport.remote();
    let session = ControllerSession::new(address, transport, settings.session.clone());

    let mut handle = session.handle();
    let (listener, mut controller_events) = ChannelListener::channel();
    handle.add_listener(listener);
    let session_task = tokio::spawn(session.run(events_rx));

    handle.connect();
    if !handle.wait_for_state(ConnectionState::Connected).await {
        anyhow::bail!("Session ended before connecting");
    }

    handle.display_led_matrix(LedMatrix::busy(), None, DisplayOptions::NONE);
    handle.display_led_matrix(LedMatrix::all_on(), Some(1.0), DisplayOptions::WITH_FADE_IN);
    handle.display_led_matrix(
        LedMatrix::all_off(),
        Some(1.0),
        DisplayOptions::WITHOUT_WRITE_RESPONSE,
    );

    remote.notify(Characteristic::ButtonSensor, vec![1]);
    remote.notify(Characteristic::RotationSensor, 120i16.to_le_bytes().to_vec());
    remote.notify(Characteristic::TouchSensor, vec![0]);
    remote.notify(Characteristic::FlySensor, vec![4, 30]);
    remote.notify(Characteristic::ButtonSensor, vec![0]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.shutdown();
    let session = session_task.await.context("Session task failed")?;

    while let Ok(event) = controller_events.try_recv() {
        match event {
            ControllerEvent::Gesture(gesture) => println!("gesture: {:?}", gesture),
            other => println!("event: {:?}", other),
        }
    }
    println!(
        "battery {:?}%, firmware {:?}, hardware {:?}, color {:?}",
        session.battery_percentage(),
        session.firmware_version(),
        session.hardware_version(),
        session.color()
    );

    Ok(())
}
