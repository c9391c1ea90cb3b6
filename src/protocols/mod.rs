pub mod output_management;
