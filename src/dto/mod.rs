pub mod assemble_dto;
