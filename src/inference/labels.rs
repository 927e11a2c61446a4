//! Class labels shared by both classifier variants.

pub const NUM_CLASSES: usize = 22;

pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "Cashew_anthracnose",
    "Cashew_gumosis",
    "Cashew_healthy",
    "Cashew_leaf miner",
    "Cashew_red rust",
    "Cassava_bacterial blight",
    "Cassava_brown spot",
    "Cassava_green mite",
    "Cassava_healthy",
    "Cassava_mosaic",
    "Maize_fall armyworm",
    "Maize_grasshoper",
    "Maize_Healthy",
    "Maize_leaf beetle",
    "Maize_leaf blight",
    "Maize_leaf spot",
    "Maize_streak virus",
    "Tomato_Healthy",
    "Tomato_leaf blight",
    "Tomato_leaf curl",
    "Tomato_septoria leaf spot",
    "Tomato_verticulium wilt",
];

pub fn class_name(index: usize) -> Option<&'static str> {
    CLASS_NAMES.get(index).copied()
}

/// Split a label on its first `_` into (plant, disease).
/// Labels without a separator report an `Unknown` plant and keep the whole label as the disease.
pub fn split_label(label: &str) -> (&str, &str) {
    label.split_once('_').unwrap_or(("Unknown", label))
}
