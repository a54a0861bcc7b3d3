#![no_std]
#![no_main]

use user::*;

#[unsafe(no_mangle)]
fn main(args: Args) {
    if args.len() < 2 {
        exit_with_msg("Usage: rm files...");
    }

    for file in args.args_as_str() {
        if unlink(file).is_err() {
            eprintln!("rm: failed to delete {}", file);
            break;
        }
    }
}
