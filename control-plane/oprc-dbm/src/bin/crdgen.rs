use kube::core::CustomResourceExt;
use oprc_dbm::crd::dormant_database::DormantDatabase;
use oprc_dbm::crd::postgres::Postgres;

fn main() -> anyhow::Result<()> {
    for crd in [Postgres::crd(), DormantDatabase::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
