use kube::CustomResourceExt;
use telemetry_k8s::crd::{LogPipeline, MetricPipeline, Telemetry, TracePipeline};

fn main() -> anyhow::Result<()> {
    let crds = [
        LogPipeline::crd(),
        MetricPipeline::crd(),
        TracePipeline::crd(),
        Telemetry::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
