//! Command-line flags. Builder-style `clap` 3.x (`App`/`Arg`) rather
//! than the derive API.

use clap::{crate_description, crate_name, crate_version, App, Arg};

pub struct Args {
    /// Number of `-v` occurrences; `PINGTUNNEL_LOG` overrides this.
    pub verbosity: u64,
    pub auto_connect: bool,
}

pub fn parse() -> Args {
    let matches = App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .multiple_occurrences(true)
                .help("Increase log verbosity (-v debug, -vv trace)"),
        )
        .arg(
            Arg::new("no-connect")
                .long("no-connect")
                .help("Start without connecting to the selected configuration"),
        )
        .get_matches();

    Args {
        verbosity: matches.occurrences_of("verbose"),
        auto_connect: !matches.is_present("no-connect"),
    }
}
