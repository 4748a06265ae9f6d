use kube::CustomResourceExt;
use provisio::crd::ManagedCluster;

fn main() {
    match serde_yaml::to_string(&ManagedCluster::crd()) {
        Ok(crd_yaml) => print!("{}", crd_yaml),
        Err(e) => {
            eprintln!("Error serializing CRD: {}", e);
            std::process::exit(1);
        }
    }
}
