//! Prints the operator's CustomResourceDefinitions as a multi-document YAML stream

use clap::Parser;
use db_operator::crd::{ConversionService, crds};

/// Generate the CRDs, pointing conversions at the operator's webhook service
#[derive(Parser, Debug)]
#[command(name = "crdgen")]
struct Args {
    /// Namespace of the webhook service
    #[arg(long, default_value = "db-operator")]
    webhook_namespace: String,

    /// Name of the webhook service
    #[arg(long, default_value = "db-operator-webhook")]
    webhook_service: String,

    /// Port of the webhook service
    #[arg(long, default_value_t = 443)]
    webhook_port: i32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let service = ConversionService {
        namespace: args.webhook_namespace,
        name: args.webhook_service,
        port: args.webhook_port,
        ..Default::default()
    };
    for crd in crds(&service)? {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
