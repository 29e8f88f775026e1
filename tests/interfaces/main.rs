//! Interface tests for event delivery using Cucumber.
//!
//! Scenarios drive the Event Bus and Delivery Sink end to end and assert on
//! what reaches live sessions:
//!
//! ```bash
//! cargo test --test interfaces
//! ```

mod steps;

use cucumber::World;
use steps::delivery::DeliveryWorld;

#[tokio::main]
async fn main() {
    hiverelay::utils::bootstrap::init_test_tracing();

    println!("\n=== Running Delivery Interface Tests ===\n");
    DeliveryWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/delivery.feature")
        .await;
}
