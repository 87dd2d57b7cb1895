use clap::{App, Arg};
use mirage::crypt::KEY_BYTES;
use vapor::crypto;
use vapor::encoding::base64;

fn main() {
    let matches = App::new("Key Generator")
        .version("1.0")
        .about("Generates tunnel keys for config files.")
        .arg(
            Arg::with_name("COUNT")
                .help("Number of keys to generate")
                .required(false),
        )
        .get_matches();

    let count: usize = matches
        .value_of("COUNT")
        .unwrap_or("1")
        .parse()
        .expect("Key count must be a valid integer");

    for _ in 0..count {
        let mut key = [0u8; KEY_BYTES];
        crypto::random_bytes(&mut key);
        println!("{}", base64::encode(&key));
    }
}
