pub mod calc;
pub mod core;
pub mod exams;
pub mod imports;
pub mod library;
pub mod marks;
pub mod students;
pub mod subjects;
