#[cfg(feature = "esp32")]
mod esp;
mod firmware;
#[cfg(not(feature = "esp32"))]
mod host;
mod provisioning;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
