use rocket::{launch, Build, Rocket};

#[launch]
fn rocket() -> Rocket<Build> {
    vitals_server::rocket()
}
