#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vm_mem_balancer::cli::run().await
}
