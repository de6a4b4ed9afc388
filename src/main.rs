fn main() {
    pomoremote_lib::run()
}
