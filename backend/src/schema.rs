diesel::table! {
    readings (id) {
        id -> Integer,
        topic -> Text,
        temperature -> Float,
        humidity -> Float,
        received_at -> BigInt,
    }
}
