use environment_operator::crd::Environment;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    let crd = Environment::crd();
    println!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
