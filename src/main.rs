use clap::{Arg, Command};
use exhume_vmdk::Handle;
use std::io::{Read, Seek, SeekFrom};

fn main() {
    env_logger::init();

    let matches = Command::new("exhume_body")
        .version("0.1")
        .author("ForensicXlab")
        .about("Prints basic info about a VMDK/COWD virtual disk and dumps a byte range.")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("Path to the descriptor file (standalone or embedded)."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(clap::value_parser!(usize))
                .default_value("512")
                .help("Number of bytes to read."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(clap::value_parser!(u64))
                .default_value("0")
                .help("Offset to read from."),
        )
        .get_matches();

    let path = matches.get_one::<String>("input").unwrap();
    let size = *matches.get_one::<usize>("size").unwrap();
    let offset = *matches.get_one::<u64>("offset").unwrap();

    let mut handle = match Handle::open(path) {
        Ok(h) => h,
        Err(err) => {
            eprintln!("Error opening '{path}': {err}");
            std::process::exit(1);
        }
    };

    println!("media size     : {} bytes", handle.media_size());
    println!("disk type      : {:?}", handle.disk_type());
    println!("content id     : {:08x}", handle.content_identifier());
    println!("extents        : {}", handle.number_of_extents());

    if let Err(err) = handle.seek(SeekFrom::Start(offset)) {
        eprintln!("Error seeking to offset {offset}: {err}");
        std::process::exit(1);
    }

    let mut buf = vec![0u8; size];
    match handle.read(&mut buf) {
        Ok(n) => println!("{}", String::from_utf8_lossy(&buf[..n])),
        Err(err) => {
            eprintln!("Error reading: {err}");
            std::process::exit(1);
        }
    }
}
