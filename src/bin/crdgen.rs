use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let resources = [
        mongo_operator::resources::MongoDB::crd(),
        mongo_operator::resources::MongoDBVersion::crd(),
    ];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource)?);
    }
    Ok(())
}
