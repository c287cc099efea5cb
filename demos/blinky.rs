//! Compiled test suite for the Nordic Blinky sample.
//!
//! ```text
//! cargo run --example blinky --features btleplug -- Nordic_Blinky
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing_subscriber::EnvFilter;

use gattbench::config::RunConfig;
use gattbench::report::{ConsoleReporter, Reporter};
use gattbench::transport::btleplug::BtleplugTransport;
use gattbench::{CharacteristicId, Suite, TestContext, TestDef, TestError, TestModule, TestResult};

const BUTTON: CharacteristicId =
    CharacteristicId::from_uuid(uuid::Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123));
const LED: CharacteristicId =
    CharacteristicId::from_uuid(uuid::Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123));

const PRESSED: [u8; 1] = [0x01];
const RELEASED: [u8; 1] = [0x00];

fn led_off(ctx: &TestContext) -> BoxFuture<'_, TestResult> {
    Box::pin(async move {
        ctx.write(&LED, &[0x00]).await?;
        Ok::<(), TestError>(())
    })
}

fn led_toggle(ctx: &TestContext) -> BoxFuture<'_, TestResult> {
    Box::pin(async move {
        for state in [[0x01], [0x00]] {
            ctx.write(&LED, &state).await?;
            ctx.sleep(Duration::from_millis(500)).await?;
            let readback = ctx.read(&LED).await?;
            ctx.ensure_eq(readback.as_slice(), &state[..], "LED readback")?;
        }
        Ok::<(), TestError>(())
    })
}

fn button_press(ctx: &TestContext) -> BoxFuture<'_, TestResult> {
    Box::pin(async move {
        let timeout = Duration::from_secs(15);
        ctx.subscribe(&BUTTON).await?;

        if ctx.read(&BUTTON).await? == PRESSED {
            tracing::warn!("button is held, waiting for release first");
            ctx.wait_for_value(&BUTTON, &RELEASED, timeout).await?;
        }
        tracing::info!("press the button on the device");
        ctx.wait_for_value(&BUTTON, &PRESSED, timeout).await?;
        tracing::info!("now release it");
        ctx.wait_for_value(&BUTTON, &RELEASED, timeout).await?;
        Ok::<(), TestError>(())
    })
}

fn led_follows_button(ctx: &TestContext) -> BoxFuture<'_, TestResult> {
    Box::pin(async move {
        let timeout = Duration::from_secs(15);
        ctx.subscribe(&BUTTON).await?;
        for _ in 0..3 {
            ctx.wait_for_value(&BUTTON, &PRESSED, timeout).await?;
            ctx.write(&LED, &[0x01]).await?;
            ctx.wait_for_value(&BUTTON, &RELEASED, timeout).await?;
            ctx.write(&LED, &[0x00]).await?;
        }
        Ok::<(), TestError>(())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = RunConfig::load_or_default();
    config.device.name = Some(std::env::args().nth(1).unwrap_or_else(|| "Nordic_Blinky".into()));

    let suite = Suite::new().with(
        TestModule::new("blinky")
            .at(file!())
            .describe("Nordic blinky")
            .teardown(led_off)
            .test(TestDef::new("test_led_toggle", led_toggle).describe("Toggle LED on and off").requires(LED))
            .test(
                TestDef::new("test_button_press", button_press)
                    .describe("Button press and release notifications")
                    .requires(BUTTON)
                    .expected_duration(Duration::from_secs(45)),
            )
            .test(
                TestDef::new("test_led_follows_button", led_follows_button)
                    .describe("LED mirrors three button presses")
                    .requires(LED)
                    .requires(BUTTON)
                    .expected_duration(Duration::from_secs(90)),
            ),
    );

    let transport = Arc::new(BtleplugTransport::new(config.device.scan_timeout()).await?);
    let report = gattbench::run(&config, transport, &suite).await?;
    ConsoleReporter { verbose: true }.report(&report)?;
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
