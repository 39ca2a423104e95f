fn main() {
    gitver::cargotime_init();
}
