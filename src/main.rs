fn main() {
    glucowatch_lib::run()
}
