fn main() {
    patchlua_lib::run()
}
