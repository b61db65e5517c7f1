//! Generate a bcrypt hash for the credentials file:
//!
//!   hasher <password>
fn main() {
    let password = match std::env::args().nth(1) {
        Some(password) => password,
        None => {
            eprintln!("usage: hasher <password>");
            std::process::exit(1);
        }
    };

    match bcrypt::hash(password.as_bytes(), bcrypt::DEFAULT_COST) {
        Ok(hash) => println!("{hash}"),
        Err(err) => {
            eprintln!("Error generating hash: {err}");
            std::process::exit(1);
        }
    }
}
