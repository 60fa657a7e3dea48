fn main() {
    if let Err(e) = trip_chat_lib::run() {
        eprintln!("trip-chat: {}", e);
        std::process::exit(1);
    }
}
